//! Authentication claims carried through sync and async request paths
//!
//! Claims mix a fixed set of typed fields with a dynamically-typed extension
//! map (everything else the token carried). Resolvers consult the typed field
//! first and fall back to a string-typed lookup in the extension map, so
//! callers never see the duality.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role prefix that marks a caller as an internal system component.
///
/// A claims value whose role list is exactly one role starting with this
/// prefix is exempt from tenancy scoping.
pub const INTERNAL_SYSTEM_ROLE_PREFIX: &str = "system_internal";

/// Reserved metadata key for the subject claim
pub const METADATA_SUBJECT: &str = "sub";
/// Reserved metadata key for the tenant claim
pub const METADATA_TENANT_ID: &str = "tenant_id";
/// Reserved metadata key for the partition claim
pub const METADATA_PARTITION_ID: &str = "partition_id";
/// Reserved metadata key for the access claim
pub const METADATA_ACCESS_ID: &str = "access_id";
/// Reserved metadata key for the contact claim
pub const METADATA_CONTACT_ID: &str = "contact_id";
/// Reserved metadata key for the device claim
pub const METADATA_DEVICE_ID: &str = "device_id";
/// Reserved metadata key for the comma-joined role list
pub const METADATA_ROLES: &str = "roles";
/// Reserved metadata key for the comma-joined language preference
pub const METADATA_LANGUAGE: &str = "lang";
/// Reserved metadata key signalling tenancy scoping should be skipped
pub const METADATA_SKIP_TENANCY: &str = "skip_tenancy";

/// Claims extracted from a verified bearer token
///
/// Immutable once installed into a request context; the ingress middleware
/// owns the only mutation window (header padding) before installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationClaims {
    /// Subject ("sub") - unique caller identifier
    #[serde(rename = "sub", default, skip_serializing_if = "String::is_empty")]
    pub subject: String,

    /// Tenant the caller belongs to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,

    /// Partition within the tenant
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition_id: String,

    /// Access grant identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_id: String,

    /// Contact identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contact_id: String,

    /// Session identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    /// Device identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,

    /// Name of the calling service, when the caller is a service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    /// Roles granted to the caller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    /// Every other claim the token carried, keyed by claim name
    #[serde(flatten)]
    pub ext: HashMap<String, Value>,
}

impl AuthenticationClaims {
    /// Resolve a claim: the typed field when non-empty, else a string-typed
    /// lookup in the extension map. Non-string extension values resolve to
    /// an empty string.
    fn resolve<'a>(&'a self, direct: &'a str, key: &str) -> &'a str {
        if !direct.is_empty() {
            return direct;
        }
        match self.ext.get(key) {
            Some(Value::String(s)) => s.as_str(),
            _ => "",
        }
    }

    /// Subject claim
    pub fn subject(&self) -> &str {
        self.resolve(&self.subject, "sub")
    }

    /// Tenant claim
    pub fn tenant_id(&self) -> &str {
        self.resolve(&self.tenant_id, "tenant_id")
    }

    /// Partition claim
    pub fn partition_id(&self) -> &str {
        self.resolve(&self.partition_id, "partition_id")
    }

    /// Access claim
    pub fn access_id(&self) -> &str {
        self.resolve(&self.access_id, "access_id")
    }

    /// Contact claim
    pub fn contact_id(&self) -> &str {
        self.resolve(&self.contact_id, "contact_id")
    }

    /// Session claim
    pub fn session_id(&self) -> &str {
        self.resolve(&self.session_id, "session_id")
    }

    /// Device claim
    pub fn device_id(&self) -> &str {
        self.resolve(&self.device_id, "device_id")
    }

    /// Calling-service claim
    pub fn service_name(&self) -> &str {
        self.resolve(&self.service_name, "service_name")
    }

    /// Roles granted to the caller.
    ///
    /// Falls back to a comma-separated `role` claim in the extension map
    /// when the typed list is empty.
    pub fn roles(&self) -> Vec<String> {
        if !self.roles.is_empty() {
            return self.roles.clone();
        }
        match self.ext.get("role") {
            Some(Value::String(s)) if !s.is_empty() => {
                s.split(',').map(|r| r.trim().to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether the caller is an internal system component: exactly one role
    /// and it starts with [`INTERNAL_SYSTEM_ROLE_PREFIX`].
    pub fn is_internal_system(&self) -> bool {
        let roles = self.roles();
        roles.len() == 1 && roles[0].starts_with(INTERNAL_SYSTEM_ROLE_PREFIX)
    }

    /// Project the claims onto the reserved message-metadata keys.
    ///
    /// Every reserved key is always present; absent values project as empty
    /// strings so consumers never have to distinguish missing from empty.
    pub fn as_metadata(&self) -> HashMap<String, String> {
        let mut m = HashMap::with_capacity(7);
        m.insert(METADATA_SUBJECT.to_string(), self.subject().to_string());
        m.insert(METADATA_TENANT_ID.to_string(), self.tenant_id().to_string());
        m.insert(
            METADATA_PARTITION_ID.to_string(),
            self.partition_id().to_string(),
        );
        m.insert(METADATA_ACCESS_ID.to_string(), self.access_id().to_string());
        m.insert(
            METADATA_CONTACT_ID.to_string(),
            self.contact_id().to_string(),
        );
        m.insert(METADATA_DEVICE_ID.to_string(), self.device_id().to_string());
        m.insert(METADATA_ROLES.to_string(), self.roles().join(","));
        m
    }

    /// Pad empty claim fields from ingress headers or metadata.
    ///
    /// `lookup` resolves the lowercase padding keys (`tenant_id`,
    /// `partition_id`, `access_id`, `contact_id`, `session_id`, `device_id`,
    /// `roles`); HTTP header lookups are case-insensitive so the title-case
    /// wire form resolves through the same names. Only internal-system
    /// claims may be padded; callers enforce that gate, and this runs
    /// before the claims are installed into a context.
    pub(crate) fn pad_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn fill(field: &mut String, value: Option<String>) {
            if field.is_empty() {
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    *field = value;
                }
            }
        }

        fill(&mut self.tenant_id, lookup("tenant_id"));
        fill(&mut self.partition_id, lookup("partition_id"));
        fill(&mut self.access_id, lookup("access_id"));
        fill(&mut self.contact_id, lookup("contact_id"));
        fill(&mut self.session_id, lookup("session_id"));
        fill(&mut self.device_id, lookup("device_id"));

        if self.roles.is_empty() {
            if let Some(roles) = lookup("roles").filter(|r| !r.is_empty()) {
                self.roles = roles.split(',').map(|r| r.trim().to_string()).collect();
            }
        }
    }

    /// Reconstruct claims from a message-metadata map.
    ///
    /// Returns `None` unless at least one of the identifying keys (`sub`,
    /// `tenant_id`, `partition_id`) is present. Keys outside the reserved
    /// projection are preserved in the extension map, so a consumer-side
    /// claims value keeps whatever extra context the producer attached.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        let present = |key: &str| metadata.get(key).map(String::as_str).unwrap_or("");

        if present(METADATA_SUBJECT).is_empty()
            && present(METADATA_TENANT_ID).is_empty()
            && present(METADATA_PARTITION_ID).is_empty()
        {
            return None;
        }

        let roles: Vec<String> = match present(METADATA_ROLES) {
            "" => Vec::new(),
            joined => joined.split(',').map(|r| r.trim().to_string()).collect(),
        };

        let mut ext = HashMap::new();
        for (key, value) in metadata {
            match key.as_str() {
                METADATA_SUBJECT
                | METADATA_TENANT_ID
                | METADATA_PARTITION_ID
                | METADATA_ACCESS_ID
                | METADATA_CONTACT_ID
                | METADATA_DEVICE_ID
                | METADATA_ROLES => {}
                _ => {
                    ext.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }

        Some(Self {
            subject: present(METADATA_SUBJECT).to_string(),
            tenant_id: present(METADATA_TENANT_ID).to_string(),
            partition_id: present(METADATA_PARTITION_ID).to_string(),
            access_id: present(METADATA_ACCESS_ID).to_string(),
            contact_id: present(METADATA_CONTACT_ID).to_string(),
            device_id: present(METADATA_DEVICE_ID).to_string(),
            roles,
            ext,
            ..Default::default()
        })
    }
}
