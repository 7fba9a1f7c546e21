use crate::common::error::RunnerError;

/// Parses a byte quantity with an optional SI or IEC suffix, for example
/// "512gb", "16gib", "1024mb", "64mib" or a bare number of bytes.  Matching
/// is case insensitive and a fractional mantissa is accepted ("1.5gb").
pub fn parse_bytes(input: &str) -> crate::Result<u64> {
    let text = input.trim();
    if text.is_empty() {
        return Err(RunnerError::Config("empty size".to_string()));
    }

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (mantissa, suffix) = text.split_at(split);
    let value: f64 = mantissa
        .parse()
        .map_err(|_| RunnerError::Config(format!("invalid size {input:?}")))?;

    let multiplier: f64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => 1e3,
        "mb" | "m" => 1e6,
        "gb" | "g" => 1e9,
        "tb" | "t" => 1e12,
        "pb" | "p" => 1e15,
        "kib" | "ki" => 1024.0,
        "mib" | "mi" => 1024.0 * 1024.0,
        "gib" | "gi" => 1024.0 * 1024.0 * 1024.0,
        "tib" | "ti" => 1024.0f64.powi(4),
        "pib" | "pi" => 1024.0f64.powi(5),
        _ => {
            return Err(RunnerError::Config(format!(
                "unrecognized size suffix in {input:?}"
            )))
        }
    };

    Ok((value * multiplier) as u64)
}

/// Renders a byte quantity for logs and operator notifications, scaled to
/// the largest binary unit that keeps the mantissa readable.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::{human_size, parse_bytes};

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("0").unwrap(), 0);
        assert_eq!(parse_bytes("0gb").unwrap(), 0);
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("1kb").unwrap(), 1000);
        assert_eq!(parse_bytes("1kib").unwrap(), 1024);
        assert_eq!(parse_bytes("512GB").unwrap(), 512_000_000_000);
        assert_eq!(parse_bytes("16gib").unwrap(), 16 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5kb").unwrap(), 1500);
        assert_eq!(parse_bytes(" 64mib ").unwrap(), 64 * 1024 * 1024);
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("12xb").is_err());
        assert!(parse_bytes("gb").is_err());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1024), "1.0 KiB");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(1024 * 1024), "1.0 MiB");
        assert_eq!(human_size(8 * 1024 * 1024 * 1024), "8.0 GiB");
        assert_eq!(human_size(2 * 1024u64.pow(4)), "2.0 TiB");
        // Round trips with the parser's IEC suffixes
        assert_eq!(parse_bytes(&human_size(1536)).unwrap(), 1536);
    }
}
