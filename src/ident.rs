//! Deterministic upload identifiers.
//!
//! An id is `{length}{hash}{DDMMYY}` where `length` is the length of the
//! sanitized filename, `hash` is the SHA-256 of that name reduced modulo
//! `10^digits` and zero padded, and the date is the server-local upload day.
//! The segments are concatenated without separators, so an id cannot be split
//! back into its parts without the record it belongs to.
//!
//! The same filename uploaded twice on the same day yields the same id. That
//! collision is accepted and left to the storage layer (the later blob wins).
use anyhow::{Result, bail};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Largest digit count whose modulus still fits the numeric form in a `u64`.
pub const MAX_DIGITS: u32 = 18;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedId {
    pub id: String,
    pub sanitized: String,
    pub length: usize,
    pub hashed_numeric: u64,
    pub date_part: String,
}

impl GeneratedId {
    /// Name the blob is stored under.
    pub fn stored_key(&self) -> String {
        stored_key(&self.id, &self.sanitized)
    }
}

pub fn stored_key(id: &str, sanitized: &str) -> String {
    format!("{id}_{sanitized}")
}

#[derive(Clone, Copy, Debug)]
pub struct IdentifierGenerator {
    digits: u32,
}

impl IdentifierGenerator {
    pub fn new(digits: u32) -> Result<Self> {
        if digits == 0 || digits > MAX_DIGITS {
            bail!("hash digit count must be between 1 and {MAX_DIGITS}, got {digits}");
        }
        Ok(Self { digits })
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    pub fn generate(&self, filename: &str, date: NaiveDate) -> GeneratedId {
        let sanitized = sanitize_filename(filename);
        let length = name_length(&sanitized);
        let hashed_numeric = hashed_numeric(&sanitized, self.digits);
        let date_part = date.format("%d%m%y").to_string();
        let id = format!(
            "{length}{hashed:0width$}{date_part}",
            hashed = hashed_numeric,
            width = self.digits as usize
        );
        GeneratedId {
            id,
            sanitized,
            length,
            hashed_numeric,
            date_part,
        }
    }
}

/// Drop any client-side directory prefix and collapse each whitespace run
/// into a single underscore.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut out = String::with_capacity(base.len());
    let mut in_whitespace = false;
    for ch in base.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
        } else {
            out.push(ch);
            in_whitespace = false;
        }
    }
    out
}

/// Length in UTF-16 code units, which is how ids minted by earlier
/// deployments measured it. Equal to the byte length for ASCII names.
pub fn name_length(sanitized: &str) -> usize {
    sanitized.encode_utf16().count()
}

/// SHA-256 of `sanitized`, read as a big-endian integer, modulo `10^digits`.
pub fn hashed_numeric(sanitized: &str, digits: u32) -> u64 {
    let modulus = 10u128.pow(digits);
    let digest = Sha256::digest(sanitized.as_bytes());
    let reduced = digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % modulus);
    // modulus <= 10^18, so the remainder fits.
    reduced as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn may_first_2024() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn sanitize_collapses_whitespace_runs() {
        assert_eq!(sanitize_filename("My Flower.JPG"), "My_Flower.JPG");
        assert_eq!(sanitize_filename("a  \t b.png"), "a_b.png");
        assert_eq!(sanitize_filename(" lead.png"), "_lead.png");
        assert_eq!(sanitize_filename("plain.png"), "plain.png");
    }

    #[test]
    fn sanitize_strips_client_directories() {
        assert_eq!(sanitize_filename("C:\\Users\\me\\rose.png"), "rose.png");
        assert_eq!(sanitize_filename("../../etc/tulip.webp"), "tulip.webp");
    }

    #[test]
    fn known_scenario_produces_expected_id() {
        let generator = IdentifierGenerator::new(9).unwrap();
        let generated = generator.generate("My Flower.JPG", may_first_2024());
        assert_eq!(generated.sanitized, "My_Flower.JPG");
        assert_eq!(generated.length, 13);
        assert_eq!(generated.hashed_numeric, 556_845_826);
        assert_eq!(generated.date_part, "010524");
        assert_eq!(generated.id, "13556845826010524");
        assert_eq!(generated.stored_key(), "13556845826010524_My_Flower.JPG");
    }

    #[test]
    fn numeric_part_is_zero_padded() {
        // sha256("a.png") mod 10^4 == 32
        let generator = IdentifierGenerator::new(4).unwrap();
        let generated = generator.generate("a.png", may_first_2024());
        assert_eq!(generated.hashed_numeric, 32);
        assert_eq!(generated.id, "50032010524");
    }

    #[test]
    fn generation_is_deterministic_per_day() {
        let generator = IdentifierGenerator::new(9).unwrap();
        let first = generator.generate("rose.png", may_first_2024());
        let second = generator.generate("rose.png", may_first_2024());
        assert_eq!(first, second);

        let next_day = generator.generate("rose.png", NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_ne!(first.id, next_day.id);
        assert_eq!(first.hashed_numeric, next_day.hashed_numeric);
    }

    #[test]
    fn max_digits_uses_full_width() {
        assert_eq!(hashed_numeric("rose.png", MAX_DIGITS), 261_051_492_857_071_173);
    }

    #[test]
    fn length_counts_utf16_units() {
        assert_eq!(name_length("rose.png"), 8);
        assert_eq!(name_length("röse.png"), 8);
        assert_eq!(name_length("🌸.png"), 6);
    }

    #[test]
    fn rejects_out_of_range_digit_counts() {
        assert!(IdentifierGenerator::new(0).is_err());
        assert!(IdentifierGenerator::new(MAX_DIGITS + 1).is_err());
        assert_eq!(IdentifierGenerator::new(MAX_DIGITS).unwrap().digits(), MAX_DIGITS);
    }
}
