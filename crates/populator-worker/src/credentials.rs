//! Credentials injected from the provider secret
//!
//! The populator pod loads the secret with `envFrom`, so every secret key is an environment
//! variable of the same name.

use crate::error::PopulatorError;
use std::env;

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, PopulatorError> {
    get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PopulatorError::Config(format!("secret key {} is missing", key)))
}

fn optional(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).filter(|v| !v.is_empty())
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    optional(get, key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// TLS trust settings common to oVirt and OpenStack
#[derive(Debug, Clone, Default)]
pub struct Trust {
    pub cacert: Option<String>,
    pub insecure_skip_verify: bool,
}

impl Trust {
    fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            cacert: optional(get, "cacert"),
            insecure_skip_verify: flag(get, "insecureSkipVerify"),
        }
    }

    /// HTTP client honouring the trust settings
    pub fn client(&self) -> Result<reqwest::Client, PopulatorError> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(self.insecure_skip_verify);
        if let Some(pem) = &self.cacert {
            for cert in reqwest::Certificate::from_pem_bundle(pem.as_bytes())? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder.build()?)
    }
}

#[derive(Clone)]
pub struct OvirtCredentials {
    pub user: String,
    pub password: String,
    pub trust: Trust,
}

impl std::fmt::Debug for OvirtCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvirtCredentials").field("user", &self.user).finish_non_exhaustive()
    }
}

impl OvirtCredentials {
    pub fn from_env() -> Result<Self, PopulatorError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, PopulatorError> {
        Ok(Self {
            user: required(&get, "user")?,
            password: required(&get, "password")?,
            trust: Trust::from_lookup(&get),
        })
    }
}

#[derive(Clone)]
pub struct OpenstackCredentials {
    pub username: String,
    pub password: String,
    pub domain_name: String,
    pub project_name: String,
    pub region_name: Option<String>,
    pub trust: Trust,
}

impl std::fmt::Debug for OpenstackCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenstackCredentials")
            .field("username", &self.username)
            .field("project_name", &self.project_name)
            .finish_non_exhaustive()
    }
}

impl OpenstackCredentials {
    pub fn from_env() -> Result<Self, PopulatorError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, PopulatorError> {
        Ok(Self {
            username: required(&get, "username")?,
            password: required(&get, "password")?,
            domain_name: optional(&get, "domainName").unwrap_or_else(|| "Default".to_string()),
            project_name: required(&get, "projectName")?,
            region_name: optional(&get, "regionName"),
            trust: Trust::from_lookup(&get),
        })
    }
}

/// AWS credentials; the target pair wins when present
pub fn ec2_credentials_from_lookup(
    get: impl Fn(&str) -> Option<String>,
) -> Result<ec2_client::Credentials, PopulatorError> {
    let (id, secret) = match (optional(&get, "targetAccessKeyId"), optional(&get, "targetSecretAccessKey")) {
        (Some(id), Some(secret)) => (id, secret),
        _ => (required(&get, "accessKeyId")?, required(&get, "secretAccessKey")?),
    };
    ec2_client::Credentials::new(id, secret)
        .map(|c| c.with_session_token(optional(&get, "sessionToken")))
        .map_err(|e| PopulatorError::Config(e.to_string()))
}

pub fn ec2_credentials_from_env() -> Result<ec2_client::Credentials, PopulatorError> {
    ec2_credentials_from_lookup(|k| env::var(k).ok())
}
