//! Resource kinds, HTTP verbs, and the endpoint registry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// HTTP verb of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the verb changes server state and may be queued.
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidOperation(format!(
                "unsupported HTTP method: {other}"
            ))),
        }
    }
}

/// Server entity types mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Employee,
    LeaveRequest,
    LeaveBalance,
}

impl ResourceKind {
    /// Pull order: employees first so later kinds can reference them.
    pub const ALL: [Self; 3] = [Self::Employee, Self::LeaveBalance, Self::LeaveRequest];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::LeaveRequest => "leave_request",
            Self::LeaveBalance => "leave_balance",
        }
    }

    /// REST collection path for this kind.
    pub const fn collection_path(self) -> &'static str {
        match self {
            Self::Employee => "/api/employees",
            Self::LeaveRequest => "/api/leaves",
            Self::LeaveBalance => "/api/balances",
        }
    }

    /// Server state always overrides local state for these kinds.
    pub const fn is_server_authoritative(self) -> bool {
        matches!(self, Self::Employee | Self::LeaveBalance)
    }

    /// Endpoint for replaying a queued write of this kind.
    ///
    /// Creates go to the collection; updates and deletes address the record.
    pub fn endpoint(self, method: HttpMethod, record_id: &str) -> Result<String> {
        let collection = self.collection_path();
        match method {
            HttpMethod::Post => Ok(collection.to_string()),
            HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete => Ok(format!(
                "{collection}/{}",
                urlencoding::encode(record_id)
            )),
            HttpMethod::Get => Err(Error::InvalidOperation(format!(
                "GET cannot be replayed against {collection}"
            ))),
        }
    }

    /// Resolve a request path such as `/api/leaves/42?x=1` to its kind and
    /// optional record id.
    pub fn from_path(path: &str) -> Option<(Self, Option<String>)> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');

        Self::ALL.into_iter().find_map(|kind| {
            let rest = path.strip_prefix(kind.collection_path())?;
            if rest.is_empty() {
                return Some((kind, None));
            }
            let record = rest.strip_prefix('/')?;
            if record.is_empty() || record.contains('/') {
                return None;
            }
            let record = urlencoding::decode(record)
                .map_or_else(|_| record.to_string(), std::borrow::Cow::into_owned);
            Some((kind, Some(record)))
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "employee" | "employees" => Ok(Self::Employee),
            "leave_request" | "leave_requests" | "leaves" => Ok(Self::LeaveRequest),
            "leave_balance" | "leave_balances" | "balances" => Ok(Self::LeaveBalance),
            other => Err(Error::InvalidInput(format!("unknown resource kind: {other}"))),
        }
    }
}
