use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Client platform class. Selects the registry partition a session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    Web,
    Mobile,
    Desktop,
    Tablet,
}

impl DeviceCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [DeviceCategory; Self::COUNT] = [
        DeviceCategory::Web,
        DeviceCategory::Mobile,
        DeviceCategory::Desktop,
        DeviceCategory::Tablet,
    ];

    /// Position of this category in [`DeviceCategory::ALL`].
    pub fn index(self) -> usize {
        match self {
            DeviceCategory::Web => 0,
            DeviceCategory::Mobile => 1,
            DeviceCategory::Desktop => 2,
            DeviceCategory::Tablet => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceCategory::Web => "web",
            DeviceCategory::Mobile => "mobile",
            DeviceCategory::Desktop => "desktop",
            DeviceCategory::Tablet => "tablet",
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" | "browser" => Ok(DeviceCategory::Web),
            "mobile" | "ios" | "android" => Ok(DeviceCategory::Mobile),
            "desktop" | "windows" | "macos" | "linux" => Ok(DeviceCategory::Desktop),
            "tablet" | "ipad" => Ok(DeviceCategory::Tablet),
            other => Err(AppError::BadRequest(format!(
                "unknown device category: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_matches_position_in_all() {
        for (i, category) in DeviceCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn parses_platform_aliases() {
        assert_eq!("iOS".parse::<DeviceCategory>().unwrap(), DeviceCategory::Mobile);
        assert_eq!(" web ".parse::<DeviceCategory>().unwrap(), DeviceCategory::Web);
        assert!("toaster".parse::<DeviceCategory>().is_err());
    }
}
