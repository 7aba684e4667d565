/*-
 * ========================LICENSE_START=================================
 * Hearth Orchestrator
 * %%
 * Copyright (C) 2023 - 2026 Hearth Project Developers
 * %%
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 * =========================LICENSE_END==================================
 */

use std::ops::Deref;
use std::str::FromStr;

/// The unique key of an app in the catalog, the state database and the
/// generated system fragment. Restricted to lowercase alphanumerics and `-`
/// because the name doubles as a systemd unit suffix and a database name.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AppName(String);

impl AppName {
    pub fn into_string(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> serde::Deserialize<'de> for AppName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let app_name = String::deserialize(deserializer)?;
        Self::from_str(&app_name).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for AppName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl Deref for AppName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for AppName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for AppName {
    type Err = AppNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let valid = !name.is_empty()
            && !name.starts_with('-')
            && !name.ends_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

        if valid {
            Ok(AppName(name.to_string()))
        } else {
            Err(AppNameError::Invalid {
                name: name.to_string(),
            })
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AppNameError {
    #[error("Invalid app name “{name}”: only lowercase letters, digits and inner dashes are allowed.")]
    Invalid { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_app_name_from_str() {
        let app_name = AppName::from_str("qbittorrent").unwrap();

        assert_eq!(app_name.0, "qbittorrent");
    }

    #[test]
    fn should_create_app_name_with_dashes_and_digits() {
        let app_name = AppName::from_str("jellyfin-2").unwrap();

        assert_eq!(app_name.0, "jellyfin-2");
    }

    #[test]
    fn should_not_create_app_name_containing_whitespace() {
        let app_name = AppName::from_str(" radarr\n ");

        assert_eq!(
            app_name,
            Err(AppNameError::Invalid {
                name: String::from(" radarr\n "),
            })
        );
    }

    #[test]
    fn should_not_create_app_name_containing_uppercase() {
        let app_name = AppName::from_str("Radarr");

        assert_eq!(
            app_name,
            Err(AppNameError::Invalid {
                name: String::from("Radarr"),
            })
        );
    }

    #[test]
    fn should_not_create_app_name_with_leading_dash() {
        let app_name = AppName::from_str("-radarr");

        assert_eq!(
            app_name,
            Err(AppNameError::Invalid {
                name: String::from("-radarr"),
            })
        );
    }

    #[test]
    fn should_not_create_empty_app_name() {
        assert!(AppName::from_str("").is_err());
    }
}
