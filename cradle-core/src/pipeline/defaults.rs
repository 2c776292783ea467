//! Default-filling middleware.
//!
//! First stage of every chain: requests arrive partially specified and
//! everything downstream assumes the blanks are filled.

use super::{DumpAdapter, DumpHandler, RestoreAdapter, RestoreHandler};

/// Fill a dump request's base directory and image-name stem.
pub fn fill_dump_defaults() -> DumpAdapter {
    Box::new(|next: DumpHandler| {
        Box::new(move |opts, resp, req| {
            if req.dir.as_os_str().is_empty() {
                req.dir = opts.config.checkpoint_base_dir.clone();
            }
            if req.name.is_empty() {
                req.name = match &req.jid {
                    Some(jid) => jid.to_string(),
                    None => "dump".to_string(),
                };
            }
            next(opts, resp, req)
        })
    })
}

/// Fill a restore request's engine defaults. The checkpoint path itself is
/// resolved by the caller (latest checkpoint for managed jobs), so only
/// flag-level blanks are handled here.
pub fn fill_restore_defaults() -> RestoreAdapter {
    Box::new(|next: RestoreHandler| {
        Box::new(move |opts, resp, req| {
            // Restored network state needs the same engine affordances the
            // dump recorded; established-TCP restore is always tolerated.
            req.engine.tcp_established = true;
            next(opts, resp, req)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_opts;
    use super::super::{adapted, DumpRequest, DumpResponse};
    use super::*;
    use crate::types::Jid;

    #[test]
    fn test_dump_dir_and_name_defaults() {
        let handler: super::super::DumpHandler = Box::new(|_, _, req| {
            assert!(!req.dir.as_os_str().is_empty());
            assert_eq!(req.name, "my-job");
            Ok(None)
        });
        let chain = adapted(handler, vec![fill_dump_defaults()]);

        let mut req = DumpRequest {
            jid: Some(Jid::new("my-job").unwrap()),
            ..Default::default()
        };
        let mut opts = test_opts();
        chain(&mut opts, &mut DumpResponse::default(), &mut req).unwrap();
    }

    #[test]
    fn test_explicit_values_kept() {
        let handler: super::super::DumpHandler = Box::new(|_, _, req| {
            assert_eq!(req.dir, std::path::PathBuf::from("/custom"));
            assert_eq!(req.name, "custom-name");
            Ok(None)
        });
        let chain = adapted(handler, vec![fill_dump_defaults()]);

        let mut req = DumpRequest {
            dir: "/custom".into(),
            name: "custom-name".to_string(),
            ..Default::default()
        };
        let mut opts = test_opts();
        chain(&mut opts, &mut DumpResponse::default(), &mut req).unwrap();
    }
}
