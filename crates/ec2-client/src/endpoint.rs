//! Regional endpoint resolution

use crate::error::Ec2Error;
use reqwest::Url;

/// Service endpoint for one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL requests are sent to
    pub url: Url,
    /// Signing region
    pub region: String,
}

impl Endpoint {
    /// Resolve the endpoint of `service` in `region`, honouring an override URL.
    ///
    /// China regions live under `amazonaws.com.cn`; every other partition (including GovCloud)
    /// uses `amazonaws.com`.
    pub fn resolve(service: &str, region: &str, override_url: Option<&str>) -> Result<Self, Ec2Error> {
        let raw = match override_url.filter(|u| !u.is_empty()) {
            Some(u) => u.to_string(),
            None => format!("https://{}.{}.{}/", service, region, dns_suffix(region)),
        };
        let url = Url::parse(&raw).map_err(|e| Ec2Error::Endpoint(format!("{}: {}", raw, e)))?;
        if url.host_str().is_none() {
            return Err(Ec2Error::Endpoint(format!("{}: missing host", raw)));
        }
        Ok(Self {
            url,
            region: region.to_string(),
        })
    }

    /// Join a path onto the base URL
    pub fn join(&self, path: &str) -> Result<Url, Ec2Error> {
        self.url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Ec2Error::Endpoint(e.to_string()))
    }
}

/// Replace the query of `url` with `params`, percent-encoded the way SigV4 canonicalizes them
pub fn set_query(url: &mut Url, params: &[(&str, &str)]) {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(if query.is_empty() { None } else { Some(&query) });
}

/// Partition name for a region
pub fn partition(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

fn dns_suffix(region: &str) -> &'static str {
    match partition(region) {
        "aws-cn" => "amazonaws.com.cn",
        _ => "amazonaws.com",
    }
}
