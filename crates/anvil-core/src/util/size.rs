use std::str::FromStr;

/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use anvil_core::util::Size;
///
/// let size = Size::MB(4);
/// assert_eq!(size.bytes(), 4 * 1024 * 1024);
///
/// let large = Size::GB(2);
/// assert_eq!(large.bytes(), 2 * (1 << 30));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes.
    ///
    /// ```
    /// use anvil_core::util::Size;
    ///
    /// assert_eq!(Size::B(100).bytes(), 100);
    /// assert_eq!(Size::KB(1).bytes(), 1024);
    /// assert_eq!(Size::GB(1).bytes(), 1073741824);
    /// ```
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb * (1 << 10),
            Size::MB(mb) => *mb * (1 << 20),
            Size::GB(gb) => *gb * (1 << 30),
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
            Size::GB(gb) => write!(f, "{} GB", gb),
        }
    }
}

/// Error returned when a size string cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid size '{0}', expected e.g. '4096', '512KB', '16MB' or '1GB'")]
pub struct ParseSizeError(String);

impl FromStr for Size {
    type Err = ParseSizeError;

    /// Parses sizes like `4096`, `64KB`, `16MB` or `1GB` (case-insensitive,
    /// optional space before the unit).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let value: usize = digits
            .parse()
            .map_err(|_| ParseSizeError(s.to_string()))?;
        match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => Ok(Size::B(value)),
            "K" | "KB" => Ok(Size::KB(value)),
            "M" | "MB" => Ok(Size::MB(value)),
            "G" | "GB" => Ok(Size::GB(value)),
            _ => Err(ParseSizeError(s.to_string())),
        }
    }
}
