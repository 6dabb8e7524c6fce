//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use hinoki_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// 整数値をパースする
///
/// 負の値は2の補数として u64 に格納する。
pub fn parse_integer(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix('-') {
        Some(rest) => {
            let magnitude = parse_address(rest)?;
            let value = i64::try_from(magnitude)
                .map_err(|_| anyhow::anyhow!("Integer '{}' is out of range", s))?;
            Ok((-value) as u64)
        }
        None => parse_address(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xabcd").unwrap(), 0xabcd);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
        assert_eq!(parse_address("9999").unwrap(), 9999);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_integer_negative() {
        assert_eq!(parse_integer("-1").unwrap(), u64::MAX);
        assert_eq!(parse_integer("-0x10").unwrap(), (-16i64) as u64);
        assert_eq!(parse_integer("42").unwrap(), 42);
        assert!(parse_integer("-").is_err());
    }
}
