//! vSphere Web Services adapter
//!
//! Speaks the SOAP API directly: `RetrieveServiceContent` then `Login` to open a session (the
//! `vmware_soap_session` cookie is replayed on later calls), `RetrieveProperties` to read
//! `runtime.powerState` or task state, and the `*_Task` methods for power and snapshot changes.
//! Snapshot creation hands back a task; the snapshot reference is only known once the task
//! has succeeded.

use super::{required, AdapterError, SecretData, SourceAdapter, Trust};
use async_trait::async_trait;
use crds::{PowerState, SnapshotRef};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use tokio::sync::Mutex;
use tracing::debug;

const SOAP_ACTION: &str = "urn:vim25/7.0";
const SESSION_COOKIE: &str = "vmware_soap_session";
const TASK_PREFIX: &str = "task-";

/// Content of the first `<tag ...>` element, tolerating attributes and namespace prefixes
pub fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        let end_of_name = rest.find(|c: char| c == '>' || c == '/' || c.is_whitespace())?;
        let name = &rest[..end_of_name];
        let local = name.rsplit(':').next().unwrap_or(name);
        if local != tag || name.starts_with('/') {
            continue;
        }
        let open_end = rest.find('>')?;
        if rest[..open_end].ends_with('/') {
            return Some("");
        }
        let body = &rest[open_end + 1..];
        let close = body.find(&format!("</{}>", name))?;
        return Some(&body[..close]);
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns="urn:vim25">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        body
    )
}

fn moref(kind: &str, value: &str) -> String {
    format!(r#"<_this type="{}">{}</_this>"#, kind, escape(value))
}

fn retrieve_property(collector: &str, kind: &str, id: &str, path: &str) -> String {
    format!(
        concat!(
            "<RetrieveProperties>{}<specSet>",
            "<propSet><type>{}</type><pathSet>{}</pathSet></propSet>",
            r#"<objectSet><obj type="{}">{}</obj></objectSet>"#,
            "</specSet></RetrieveProperties>"
        ),
        moref("PropertyCollector", collector),
        kind,
        path,
        kind,
        escape(id)
    )
}

/// Map `VirtualMachinePowerState` to the controller's view
pub fn parse_power_state(value: &str) -> PowerState {
    match value.trim() {
        "poweredOn" => PowerState::On,
        // suspended guests hold no running disk writes
        "poweredOff" | "suspended" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

/// Value of the first property returned by `RetrieveProperties`
pub fn property_value(response: &str, path: &str) -> Option<String> {
    let mut rest = response;
    while let Some(set) = element(rest, "propSet") {
        if element(set, "name").map(str::trim) == Some(path) {
            return element(set, "val").map(|v| v.trim().to_string());
        }
        let offset = rest.find(set).map(|i| i + set.len())?;
        rest = &rest[offset..];
    }
    None
}

fn fault(response: &str) -> Option<String> {
    element(response, "Fault").map(|f| element(f, "faultstring").unwrap_or(f).trim().to_string())
}

fn session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .find(|v| v.trim_start().starts_with(SESSION_COOKIE))
        .map(|v| v.trim().to_string())
}

#[derive(Debug, Clone)]
struct Session {
    cookie: String,
    property_collector: String,
}

/// Adapter for vCenter or standalone ESXi
pub struct VSphereAdapter {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    session: Mutex<Option<Session>>,
}

impl VSphereAdapter {
    /// Create an adapter; `url` is the SDK endpoint (`https://host/sdk`)
    pub fn new(url: &str, secret: &SecretData) -> Result<Self, AdapterError> {
        Ok(Self {
            client: Trust::from_secret(secret).client()?,
            url: url.trim_end_matches('/').to_string(),
            user: required(secret, "user")?.to_string(),
            password: required(secret, "password")?.to_string(),
            session: Mutex::new(None),
        })
    }

    async fn call(&self, cookie: Option<&str>, body: &str) -> Result<(String, reqwest::header::HeaderMap), AdapterError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope(body));
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;
        if let Some(message) = fault(&text) {
            if message.contains("NotAuthenticated") || message.contains("InvalidLogin") || message.contains("incorrect user name") {
                return Err(AdapterError::Authentication(message));
            }
            if message.contains("ManagedObjectNotFound") || message.contains("has already been deleted") {
                return Err(AdapterError::NotFound(message));
            }
            return Err(AdapterError::Api { status: status.as_u16(), message });
        }
        if !status.is_success() {
            return Err(AdapterError::from_status(status, "vsphere", &text));
        }
        Ok((text, headers))
    }

    async fn login(&self) -> Result<Session, AdapterError> {
        let (content, _) = self
            .call(None, &format!("<RetrieveServiceContent>{}</RetrieveServiceContent>", moref("ServiceInstance", "ServiceInstance")))
            .await?;
        let manager = element(&content, "sessionManager")
            .ok_or_else(|| AdapterError::Malformed("service content has no sessionManager".to_string()))?;
        let property_collector = element(&content, "propertyCollector")
            .ok_or_else(|| AdapterError::Malformed("service content has no propertyCollector".to_string()))?
            .trim()
            .to_string();
        let login = format!(
            "<Login>{}<userName>{}</userName><password>{}</password></Login>",
            moref("SessionManager", manager.trim()),
            escape(&self.user),
            escape(&self.password)
        );
        let (_, headers) = self.call(None, &login).await?;
        let cookie = session_cookie(&headers).ok_or_else(|| AdapterError::Authentication("login returned no session cookie".to_string()))?;
        debug!("Opened vSphere session at {}", self.url);
        Ok(Session { cookie, property_collector })
    }

    async fn session(&self) -> Result<Session, AdapterError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Call with the cached session, logging in again once if it expired
    async fn invoke(&self, body: impl Fn(&Session) -> String) -> Result<String, AdapterError> {
        let session = self.session().await?;
        match self.call(Some(&session.cookie), &body(&session)).await {
            Err(AdapterError::Authentication(_)) => {
                *self.session.lock().await = None;
                let session = self.session().await?;
                Ok(self.call(Some(&session.cookie), &body(&session)).await?.0)
            }
            other => Ok(other?.0),
        }
    }

    async fn property(&self, kind: &str, id: &str, path: &str) -> Result<Option<String>, AdapterError> {
        let response = self.invoke(|s| retrieve_property(&s.property_collector, kind, id, path)).await?;
        Ok(property_value(&response, path))
    }

    async fn start_task(&self, method: &str, kind: &str, id: &str, args: &str) -> Result<String, AdapterError> {
        let response = self
            .invoke(|_| format!("<{m}>{}{}</{m}>", moref(kind, id), args, m = method))
            .await?;
        element(&response, "returnval")
            .map(|t| t.trim().to_string())
            .ok_or_else(|| AdapterError::Malformed(format!("{} returned no task", method)))
    }
}

#[async_trait]
impl SourceAdapter for VSphereAdapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        *self.session.lock().await = None;
        self.session().await.map(|_| ())
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        let value = self.property("VirtualMachine", vm_id, "runtime.powerState").await?;
        Ok(value.as_deref().map(parse_power_state).unwrap_or(PowerState::Unknown))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.start_task("PowerOffVM_Task", "VirtualMachine", vm_id, "").await.map(|_| ())
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        self.start_task("PowerOnVM_Task", "VirtualMachine", vm_id, "").await.map(|_| ())
    }

    async fn create_snapshot(&self, vm_id: &str, _disk_ids: &[String], label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        let args = format!(
            "<name>{}</name><description>{}</description><memory>false</memory><quiesce>false</quiesce>",
            escape(label),
            escape("Migration snapshot")
        );
        let task = self.start_task("CreateSnapshot_Task", "VirtualMachine", vm_id, &args).await?;
        Ok(vec![SnapshotRef { id: task, disk_id: None }])
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        if !snapshot.id.starts_with(TASK_PREFIX) {
            return Ok(Some(snapshot.clone()));
        }
        match self.property("Task", &snapshot.id, "info.state").await?.as_deref() {
            Some("success") => {
                let result = self
                    .property("Task", &snapshot.id, "info.result")
                    .await?
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| AdapterError::Malformed(format!("task {} has no result", snapshot.id)))?;
                Ok(Some(SnapshotRef { id: result, disk_id: None }))
            }
            Some("error") => {
                let message = self.property("Task", &snapshot.id, "info.error.localizedMessage").await?;
                Err(AdapterError::Api {
                    status: 500,
                    message: message.unwrap_or_else(|| format!("snapshot task {} failed", snapshot.id)),
                })
            }
            _ => Ok(None),
        }
    }

    async fn remove_snapshot(&self, vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        let resolved = match self.snapshot_ready(vm_id, snapshot).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Err(AdapterError::Api { status: 503, message: format!("snapshot task {} still running", snapshot.id) }),
            Err(AdapterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self
            .start_task("RemoveSnapshot_Task", "VirtualMachineSnapshot", &resolved.id, "<removeChildren>false</removeChildren>")
            .await
        {
            Err(AdapterError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
