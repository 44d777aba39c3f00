// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A string tag identifying one social-media web platform.
///
/// The orchestration core treats the tag as opaque: plugins are looked up by
/// `(kind, platform)` and any tag a plugin registers under is valid. The four
/// platforms of the upload API additionally carry a numeric type code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    /// Wraps a raw platform tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves an upload-API numeric platform code.
    ///
    /// Mapping: `1 → xiaohongshu`, `2 → wechat`, `3 → douyin`,
    /// `4 → kuaishou`. Any other code is unknown.
    #[must_use]
    pub fn from_type_code(code: u8) -> Option<Self> {
        let tag = match code {
            1 => "xiaohongshu",
            2 => "wechat",
            3 => "douyin",
            4 => "kuaishou",
            _ => return None,
        };
        Some(Self(tag.to_owned()))
    }

    /// The upload-API numeric code for this platform, if it has one.
    #[must_use]
    pub fn type_code(&self) -> Option<u8> {
        match self.0.as_str() {
            "xiaohongshu" => Some(1),
            "wechat" => Some(2),
            "douyin" => Some(3),
            "kuaishou" => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(tag: &str) -> Self {
        Self(tag.to_owned())
    }
}

impl From<String> for Platform {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::Platform;

    #[test]
    fn type_codes_round_trip() {
        for code in 1..=4 {
            let platform = Platform::from_type_code(code).unwrap();
            assert_eq!(platform.type_code(), Some(code));
        }
        assert_eq!(Platform::from_type_code(0), None);
        assert_eq!(Platform::from_type_code(5), None);
        assert_eq!(Platform::new("weibo").type_code(), None);
    }

    #[test]
    fn code_mapping_is_stable() {
        assert_eq!(Platform::from_type_code(1).unwrap().as_str(), "xiaohongshu");
        assert_eq!(Platform::from_type_code(2).unwrap().as_str(), "wechat");
        assert_eq!(Platform::from_type_code(3).unwrap().as_str(), "douyin");
        assert_eq!(Platform::from_type_code(4).unwrap().as_str(), "kuaishou");
    }
}
