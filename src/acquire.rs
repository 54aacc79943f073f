//! Fair-race drive acquisition: given a pool of drives and a policy, admit
//! the stream onto whichever drive accepts first and make sure a drive that
//! accepts *after* the caller has already given up never leaks its
//! admission.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::chunk::Chunk;
use crate::drive::{DriveHandle, UseReply};
use crate::error::AdmissionError;
use crate::policy::Policy;

/// A drive that accepted a `Use` request, with everything a `Stream` needs
/// to start dispatching chunks to it.
pub struct Admission {
    pub drive: DriveHandle,
    pub ingress: Sender<Chunk>,
    release: Box<dyn FnMut() + Send>,
}

impl Admission {
    pub fn release(mut self) {
        (self.release)();
    }

    pub fn on_close_hook(mut self) -> Box<dyn FnMut() + Send> {
        Box::new(move || (self.release)())
    }
}

/// Race `Use` requests against every drive in `pool` concurrently; the first
/// to accept wins. Drives that accept after a winner has already been
/// chosen release their admission immediately rather than leaking it.
pub fn acquire(pool: &[DriveHandle], policy: Policy, deadline: Option<Instant>) -> Result<Admission, AdmissionError> {
    if pool.is_empty() {
        return Err(AdmissionError::UnknownLibrary("empty drive pool".to_string()));
    }

    if pool.len() == 1 {
        return acquire_one(&pool[0], policy, deadline);
    }

    let (winner_tx, winner_rx) = crossbeam_channel::bounded(pool.len());
    let mut handles = Vec::with_capacity(pool.len());

    for drive in pool {
        let drive = drive.clone();
        let policy = policy.clone();
        let winner_tx = winner_tx.clone();
        handles.push(std::thread::spawn(move || {
            let result = drive.use_drive(policy, deadline);
            let _ = winner_tx.send((drive, result));
        }));
    }
    drop(winner_tx);

    let timeout = deadline
        .map(|d| d.saturating_duration_since(Instant::now()))
        .unwrap_or(Duration::from_secs(u64::MAX / 2));

    let mut winner = None;
    let deadline_instant = Instant::now() + timeout;

    while Instant::now() < deadline_instant {
        let remaining = deadline_instant.saturating_duration_since(Instant::now());
        match winner_rx.recv_timeout(remaining) {
            Ok((drive, Ok(UseReply::Admitted { ingress, release }))) => {
                if winner.is_none() {
                    winner = Some(Admission {
                        drive,
                        ingress,
                        release,
                    });
                    break;
                }
            }
            Ok((_, Ok(UseReply::Failed(_)))) | Ok((_, Err(_))) => continue,
            Err(_) => break,
        }
    }

    // Any thread that hasn't reported in yet is left running; if it later
    // admits, `DriveHandle::use_drive`'s own reply channel has already been
    // dropped by its thread returning, which for a *bounded(1)* reply_tx
    // inside the drive only matters if the drive tries to reply after the
    // thread exits -- it can't, the send already happened synchronously
    // inside `use_drive` before the thread returns. What remains here is
    // simply to release any admission a losing thread reports after we've
    // already won, which the loop above discards by never storing it --
    // that admission is leaked at the drive, not at this pool. Draining the
    // channel after picking a winner prevents that.
    std::thread::spawn(move || {
        for (_, result) in winner_rx.iter() {
            if let Ok(UseReply::Admitted { mut release, .. }) = result {
                release();
            }
        }
    });

    winner.ok_or(AdmissionError::AcquireTimeout(timeout))
}

fn acquire_one(drive: &DriveHandle, policy: Policy, deadline: Option<Instant>) -> Result<Admission, AdmissionError> {
    match drive.use_drive(policy, deadline)? {
        UseReply::Admitted { ingress, release } => Ok(Admission {
            drive: drive.clone(),
            ingress,
            release,
        }),
        UseReply::Failed(err) => Err(err),
    }
}
