/*!
Tests for error types and their classification.
*/

#[cfg(test)]
mod tests {
    use crate::error::CapsuleError;
    use std::io;

    #[test]
    fn test_capsule_error_display() {
        let error = CapsuleError::validation("max_backup_count must be at least 1");
        assert_eq!(
            error.to_string(),
            "Validation error: max_backup_count must be at least 1"
        );

        let error = CapsuleError::compression("bad header");
        assert_eq!(error.to_string(), "Compression error: bad header");

        let error = CapsuleError::storage("disk full");
        assert_eq!(error.to_string(), "Storage error: disk full");

        let error = CapsuleError::engine("shim_read_pdb", "parse failure");
        assert_eq!(
            error.to_string(),
            "Engine command 'shim_read_pdb' failed: parse failure"
        );
    }

    #[test]
    fn test_not_found_names_the_payload() {
        let error = CapsuleError::not_found("mapData", "3f2a");
        assert_eq!(error.to_string(), "mapData '3f2a' not found in store");
    }

    #[test]
    fn test_quota_exceeded_display() {
        let error = CapsuleError::QuotaExceeded {
            requested: 2048,
            available: 100,
        };
        assert!(error.to_string().contains("2048"));
        assert!(error.to_string().contains("100"));
    }

    #[test]
    fn test_capsule_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "Access denied");
        match CapsuleError::from(io_error) {
            CapsuleError::Io(ref inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_capsule_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(CapsuleError::from(json_error), CapsuleError::Json(_)));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(CapsuleError::storage("x").is_store_error());
        assert!(CapsuleError::compression("x").is_store_error());
        assert!(CapsuleError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_store_error());
        assert!(CapsuleError::QuotaExceeded {
            requested: 1,
            available: 0
        }
        .is_store_error());

        assert!(!CapsuleError::engine("get_map", "x").is_store_error());
        assert!(!CapsuleError::not_found("mtzData", "x").is_store_error());
        assert!(!CapsuleError::invalid_session("x").is_store_error());
        assert!(!CapsuleError::validation("x").is_store_error());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<CapsuleError>();
        assert_sync::<CapsuleError>();
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(CapsuleError::invalid_session("no mapData"))
        }

        assert!(matches!(returns_error(), Err(CapsuleError::InvalidSession(_))));
    }
}
