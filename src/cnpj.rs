//! Brazilian company tax id (CNPJ) check digits.

const WEIGHTS_FIRST: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const WEIGHTS_SECOND: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

fn digits(raw: &str) -> Vec<u32> {
    raw.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn check_digit(body: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = body.iter().zip(weights).map(|(d, w)| d * w).sum();
    match sum % 11 {
        r if r < 2 => 0,
        r => 11 - r,
    }
}

/// Mod-11 validation. Punctuation is ignored; anything that is not exactly
/// 14 digits, or is one digit repeated, is invalid.
pub fn is_valid(raw: &str) -> bool {
    let d = digits(raw);
    if d.len() != 14 || d.iter().all(|x| *x == d[0]) {
        return false;
    }
    check_digit(&d[..12], &WEIGHTS_FIRST) == d[12] && check_digit(&d[..13], &WEIGHTS_SECOND) == d[13]
}

/// `XX.XXX.XXX/XXXX-XX`, or the input unchanged when it is not 14 digits.
pub fn format(raw: &str) -> String {
    let d: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if d.len() != 14 {
        return raw.to_string();
    }
    format!("{}.{}.{}/{}-{}", &d[..2], &d[2..5], &d[5..8], &d[8..12], &d[12..])
}
