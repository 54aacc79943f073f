//! Drive groups: a named set of drives that collectively serve one parallel
//! stream. Parallel admission acquires every member drive under the same
//! policy and timeout, releasing whatever it already holds if any member
//! fails or the deadline passes.

use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::acquire::Admission;
use crate::chunk::Chunk;
use crate::drive::{DriveHandle, UseReply};
use crate::error::AdmissionError;
use crate::policy::Policy;

pub struct DriveGroup {
    pub name: String,
    pub members: Vec<DriveHandle>,
    aggregate_tx: Sender<Chunk>,
}

/// Every member drive's writer selects on this receiver in addition to its
/// own direct ingress, so a parallel stream's chunks land wherever a writer
/// happens to be free next.
pub struct AggregateIngress(pub Receiver<Chunk>);

impl DriveGroup {
    pub fn new(name: impl Into<String>, members: Vec<DriveHandle>) -> (DriveGroup, AggregateIngress) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            DriveGroup {
                name: name.into(),
                members,
                aggregate_tx: tx,
            },
            AggregateIngress(rx),
        )
    }

    /// Build a group around a channel that already exists -- used when the
    /// aggregate sender must be handed to each member drive (via
    /// `DriveEnvironment`/`drive::spawn`) before the group itself can be
    /// constructed.
    pub fn from_parts(name: impl Into<String>, members: Vec<DriveHandle>, aggregate_tx: Sender<Chunk>) -> DriveGroup {
        DriveGroup {
            name: name.into(),
            members,
            aggregate_tx,
        }
    }

    pub fn aggregate_sender(&self) -> Sender<Chunk> {
        self.aggregate_tx.clone()
    }

    /// Acquire every member drive under `policy`/`deadline`. On partial
    /// failure, releases whatever was already acquired before returning the
    /// error.
    pub fn acquire_all(&self, policy: Policy, deadline: Option<Instant>) -> Result<GroupAdmission, AdmissionError> {
        let mut acquired: Vec<Admission> = Vec::with_capacity(self.members.len());

        for drive in &self.members {
            match drive.use_drive(policy.clone(), deadline) {
                Ok(UseReply::Admitted { ingress, release }) => {
                    acquired.push(Admission {
                        drive: drive.clone(),
                        ingress,
                        release,
                    });
                }
                Ok(UseReply::Failed(err)) => {
                    release_all(acquired);
                    return Err(err);
                }
                Err(err) => {
                    release_all(acquired);
                    return Err(AdmissionError::ParallelAcquireTimeout {
                        group: self.name.clone(),
                        timeout: deadline
                            .map(|d| d.saturating_duration_since(Instant::now()))
                            .unwrap_or_default(),
                    }
                    .also_log(err));
                }
            }
        }

        Ok(GroupAdmission {
            out: self.aggregate_tx.clone(),
            members: acquired,
        })
    }
}

fn release_all(admissions: Vec<Admission>) {
    for admission in admissions {
        admission.release();
    }
}

/// The result of successfully acquiring every drive in a group. `out` is
/// what the stream should send chunks to; dropping (or explicitly closing)
/// this releases every member drive.
pub struct GroupAdmission {
    pub out: Sender<Chunk>,
    members: Vec<Admission>,
}

impl GroupAdmission {
    pub fn on_close_hook(self) -> Box<dyn FnMut() + Send> {
        let mut members = self.members;
        Box::new(move || {
            while let Some(admission) = members.pop() {
                admission.release();
            }
        })
    }
}

trait AlsoLog {
    fn also_log(self, err: AdmissionError) -> AdmissionError;
}

impl AlsoLog for AdmissionError {
    fn also_log(self, err: AdmissionError) -> AdmissionError {
        log::debug!("member drive acquisition failed: {err}");
        self
    }
}
