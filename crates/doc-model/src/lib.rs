use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("signature size must be a percentage in (0, 100], got {0}")]
    InvalidSignatureSize(f32),
    #[error("unknown signature color `{0}` (expected black, red or blue)")]
    UnknownColor(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureColor {
    #[default]
    Black,
    Red,
    Blue,
}

impl SignatureColor {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Self::Black => [0, 0, 0],
            Self::Red => [255, 0, 0],
            Self::Blue => [0, 0, 255],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Black => "black",
            Self::Red => "red",
            Self::Blue => "blue",
        }
    }
}

impl fmt::Display for SignatureColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureColor {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "black" => Ok(Self::Black),
            "red" => Ok(Self::Red),
            "blue" => Ok(Self::Blue),
            other => Err(ModelError::UnknownColor(other.to_owned())),
        }
    }
}

/// Signature width as a percentage of the rasterized page width.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct SignatureSize(f32);

impl SignatureSize {
    pub const DEFAULT_PERCENT: f32 = 17.0;

    pub fn new(percent: f32) -> Result<Self, ModelError> {
        if percent.is_finite() && percent > 0.0 && percent <= 100.0 {
            Ok(Self(percent))
        } else {
            Err(ModelError::InvalidSignatureSize(percent))
        }
    }

    pub fn percent(self) -> f32 {
        self.0
    }

    pub fn fraction(self) -> f32 {
        self.0 / 100.0
    }
}

impl Default for SignatureSize {
    fn default() -> Self {
        Self(Self::DEFAULT_PERCENT)
    }
}

impl TryFrom<f32> for SignatureSize {
    type Error = ModelError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SignatureSize> for f32 {
    fn from(value: SignatureSize) -> Self {
        value.0
    }
}

impl FromStr for SignatureSize {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('%');
        let percent =
            trimmed.parse::<f32>().map_err(|_| ModelError::InvalidSignatureSize(f32::NAN))?;
        Self::new(percent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub sign_all_pages: bool,
    pub signature_size: SignatureSize,
    pub signature_color: SignatureColor,
}
