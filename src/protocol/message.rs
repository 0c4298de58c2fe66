//! Application-level pub/sub message
//!
//! A message travels as three `\n`-separated sections:
//!
//! ```text
//! /foo/bar,42,user01,phone01,{"user":"user01"},1420110000,1
//! {"Content-Type": "text/plain"}
//! Hello World
//! ```
//!
//! The first line holds `path,id,user_id,application_id,filters,time,node_id`,
//! the second the header JSON, and everything after the second newline is the body.
use std::collections::BTreeMap;

use crate::error::Result;
use crate::parse_error;

/// Topic path of a message, always starting with `/`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(String);

impl Path {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(parse_error!("path must start with '/': {:?}", path));
        }
        if path.contains(',') || path.contains('\n') {
            return Err(parse_error!("path contains a reserved character: {:?}", path));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First segment of the path, e.g. `foo` for `/foo/bar`
    pub fn partition(&self) -> &str {
        self.0
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `user_id` and `application_id` must not contain `,` and `header_json`
/// must not contain `\n`, or the message will not parse back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub path: Path,
    pub user_id: String,
    pub application_id: String,
    pub filters: BTreeMap<String, String>,
    /// Unix timestamp in seconds
    pub time: i64,
    /// Node that accepted the message from its publisher
    pub node_id: u32,
    pub header_json: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(path: Path, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: 0,
            path,
            user_id: String::new(),
            application_id: String::new(),
            filters: BTreeMap::new(),
            time: 0,
            node_id: 0,
            header_json: String::new(),
            body: body.into(),
        }
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn metadata(&self) -> String {
        // A BTreeMap<String, String> always serializes
        let filters = serde_json::to_string(&self.filters).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{},{},{},{},{},{},{}",
            self.path, self.id, self.user_id, self.application_id, filters, self.time, self.node_id
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let metadata = self.metadata();
        let mut out =
            Vec::with_capacity(metadata.len() + self.header_json.len() + self.body.len() + 2);
        out.extend_from_slice(metadata.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.header_json.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(parse_error!("empty message"));
        }
        let mut sections = data.splitn(3, |b| *b == b'\n');
        let metadata = sections.next().unwrap_or_default();
        let header = sections.next().unwrap_or_default();
        let body = sections.next().unwrap_or_default();

        let metadata = std::str::from_utf8(metadata)
            .map_err(|e| parse_error!("metadata is not UTF-8: {}", e))?;
        let header_json = std::str::from_utf8(header)
            .map_err(|e| parse_error!("header is not UTF-8: {}", e))?
            .to_string();

        // path,id,user,app are comma free; the filters JSON may contain commas,
        // so the trailing time and node_id are split off from the right.
        let mut head = metadata.splitn(5, ',');
        let path = head.next().unwrap_or_default();
        let id = head.next();
        let user_id = head.next();
        let application_id = head.next();
        let rest = head.next();
        let (Some(id), Some(user_id), Some(application_id), Some(rest)) =
            (id, user_id, application_id, rest)
        else {
            return Err(parse_error!("metadata has too few fields: {:?}", metadata));
        };
        let mut tail = rest.rsplitn(3, ',');
        let node_id = tail.next();
        let time = tail.next();
        let filters = tail.next();
        let (Some(node_id), Some(time), Some(filters)) = (node_id, time, filters) else {
            return Err(parse_error!("metadata has too few fields: {:?}", metadata));
        };

        let filters: BTreeMap<String, String> = if filters.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(filters).map_err(|e| parse_error!("invalid filters: {}", e))?
        };

        Ok(Self {
            id: id
                .parse()
                .map_err(|e| parse_error!("invalid message id {:?}: {}", id, e))?,
            path: Path::new(path)?,
            user_id: user_id.to_string(),
            application_id: application_id.to_string(),
            filters,
            time: time
                .parse()
                .map_err(|e| parse_error!("invalid time {:?}: {}", time, e))?,
            node_id: node_id
                .parse()
                .map_err(|e| parse_error!("invalid node id {:?}: {}", node_id, e))?,
            header_json,
            body: body.to_vec(),
        })
    }
}
