use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Script-app credentials for the password grant.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(rename = "appid")]
    pub app_id: String,
    #[serde(rename = "appsecret")]
    pub app_secret: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Auth(format!(
                "Could not access credential file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let credentials: Credentials = serde_json::from_str(&content).map_err(|e| {
            Error::Auth(format!(
                "Could not parse credential file '{}': {}",
                path.display(),
                e
            ))
        })?;
        credentials.validate()?;
        Ok(credentials)
    }

    fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("appid", &self.app_id),
            ("appsecret", &self.app_secret),
            ("username", &self.username),
            ("password", &self.password),
        ]
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| *name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Auth(format!(
                "Credential file is missing: {}",
                missing.join(", ")
            )))
        }
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
