use rand::Rng;

/// Uppercase alphabet with the ambiguous glyphs (0/O, 1/I) removed, so
/// codes survive being read aloud across a table.
pub const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Produce one candidate join code. Collision checking against live
/// sessions is the registry's job; this only draws from the code space.
pub fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..JOIN_CODE_ALPHABET.len());
            JOIN_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Canonical form used for index keys and lookups: trimmed, uppercased.
pub fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Whether a normalized code could have been produced by `generate`.
pub fn is_well_formed(code: &str, len: usize) -> bool {
    code.len() == len && code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b))
}
