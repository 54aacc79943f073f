//! Write policy: the set of options a client may request for one archive
//! write, derived from request headers (see `api::obj`).

use std::time::Duration;

/// Options governing how one archive write is admitted and acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Acknowledge every chunk before accepting the next write call.
    pub acknowledged: bool,
    /// Non-empty iff this is a parallel stream that must attach to every
    /// drive in the named group.
    pub write_group: String,
    /// Demand sole use of the drive(s) this stream holds.
    pub exclusive: bool,
    /// Maximum time to wait to secure exclusive drives. `None` means wait
    /// indefinitely.
    pub exclusive_timeout: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            acknowledged: true,
            write_group: String::new(),
            exclusive: false,
            exclusive_timeout: None,
        }
    }
}

impl Policy {
    /// A stream is parallel iff it names a write group.
    pub fn parallel(&self) -> bool {
        !self.write_group.is_empty()
    }

    /// Build a policy from the raw header values on a `PUT /obj/{id}`
    /// request. Unknown headers are ignored by the caller before this is
    /// invoked; this only interprets the ones the write path understands.
    pub fn from_headers(
        acknowledged_write: Option<&str>,
        write_group: Option<&str>,
        exclusive: Option<&str>,
        exclusive_timeout: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        let mut policy = Policy::default();

        if let Some(v) = acknowledged_write {
            policy.acknowledged = parse_yes_no(v)?;
        }

        if let Some(parallel) = policy.parallel_default(write_group) {
            policy.write_group = parallel;
            // Parallel streams default to unacknowledged writes: the client
            // trades per-chunk durability confirmation for throughput.
            if acknowledged_write.is_none() {
                policy.acknowledged = false;
            }
        }

        if let Some(v) = exclusive {
            policy.exclusive = parse_yes_no(v)?;
        }

        if let Some(v) = exclusive_timeout {
            policy.exclusive_timeout = Some(crate::duration::parse_duration(v)?);
        }

        Ok(policy)
    }

    fn parallel_default(&self, write_group: Option<&str>) -> Option<String> {
        write_group
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

fn parse_yes_no(v: &str) -> Result<bool, anyhow::Error> {
    match v {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => anyhow::bail!("expected \"yes\" or \"no\", got \"{other}\""),
    }
}
