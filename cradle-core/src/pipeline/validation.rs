//! Request validation middleware.
//!
//! Runs once, early, so every later stage can assume a well-formed
//! request: details present where required, detail variant matching the
//! declared kind, and targets actually identified. Validation failures are
//! never retried.

use crate::error::ValidationError;
use crate::types::{JobDetails, JobKind};

use super::{DumpAdapter, DumpHandler, RestoreAdapter, RestoreHandler, RunAdapter, RunHandler};

fn check_details(
    kind: JobKind,
    details: &Option<JobDetails>,
    context: &'static str,
) -> Result<(), ValidationError> {
    let Some(details) = details else {
        return Err(ValidationError::MissingField {
            field: "details",
            context,
        });
    };
    details.check_kind(kind)?;

    if let JobDetails::Process { pid } = details {
        if *pid == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "details.pid",
                value: "0".to_string(),
                reason: "target PID must be non-zero".to_string(),
            });
        }
    }
    Ok(())
}

pub fn validate_dump() -> DumpAdapter {
    Box::new(|next: DumpHandler| {
        Box::new(move |opts, resp, req| {
            check_details(req.kind, &req.details, "dump request")?;
            next(opts, resp, req)
        })
    })
}

pub fn validate_restore() -> RestoreAdapter {
    Box::new(|next: RestoreHandler| {
        Box::new(move |opts, resp, req| {
            if req.path.is_none() {
                return Err(ValidationError::MissingField {
                    field: "path",
                    context: "restore request",
                }
                .into());
            }
            // Details are optional on restore (the checkpoint metadata is
            // authoritative), but a present variant must match the kind.
            if let Some(details) = &req.details {
                details.check_kind(req.kind)?;
            }
            next(opts, resp, req)
        })
    })
}

pub fn validate_run() -> RunAdapter {
    Box::new(|next: RunHandler| {
        Box::new(move |opts, resp, req| {
            if req.kind == JobKind::Process && req.command.is_empty() {
                return Err(ValidationError::MissingField {
                    field: "command",
                    context: "run request",
                }
                .into());
            }
            if let Some(details) = &req.details {
                details.check_kind(req.kind)?;
            }
            next(opts, resp, req)
        })
    })
}
