/*!
Tests for store keys, backup descriptors and labels, including edge cases.
*/

#[cfg(test)]
mod tests {
    use crate::key::{BackupEntry, BackupKey, BackupKind, StoreKey};
    use chrono::{FixedOffset, Utc};

    fn key(date_time: i64, mols: &[&str]) -> BackupKey {
        BackupKey::new(
            date_time,
            mols.iter().map(|m| m.to_string()).collect(),
            vec!["map-1".into()],
            vec!["data.mtz".into()],
        )
    }

    #[test]
    fn test_parse_accepts_numeric_date_time() {
        let raw = r#"{"type":"manual","dateTime":1700000000000,"molNames":["a"],"mapNames":[],"mtzNames":[]}"#;
        let parsed = StoreKey::parse(raw).unwrap();
        let (kind, backup) = parsed.as_backup().unwrap();
        assert_eq!(kind, BackupKind::Manual);
        assert_eq!(backup.date_time, 1700000000000);
    }

    #[test]
    fn test_parse_tolerates_missing_name_lists() {
        let parsed = StoreKey::parse(r#"{"type":"automatic","dateTime":"42"}"#).unwrap();
        let (_, backup) = parsed.as_backup().unwrap();
        assert!(backup.mol_names.is_empty());
        assert!(backup.label.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(StoreKey::parse(r#"{"type":"thumbnail","name":"x"}"#).is_err());
        assert!(StoreKey::parse("not json").is_err());
        assert!(StoreKey::parse(r#"{"type":"automatic","dateTime":"soon"}"#).is_err());
    }

    #[test]
    fn test_label_survives_key_round_trip() {
        let store_key = StoreKey::backup(BackupKind::Automatic, key(0, &["a"]).labelled(BackupKind::Automatic));
        let parsed = StoreKey::parse(&store_key.to_key_string().unwrap()).unwrap();
        assert_eq!(parsed, store_key);
        let (_, backup) = parsed.as_backup().unwrap();
        assert!(backup.label.as_deref().unwrap().ends_with("-- AUTO"));
    }

    #[test]
    fn test_label_uses_time_zone() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let label = key(0, &["a"]).label_in(BackupKind::Manual, &tz);
        assert_eq!(label, "a -- Thursday, January 1, 1970 1:0:0 -- MANUAL");
    }

    #[test]
    fn test_label_boundary_lengths() {
        let exactly_ten = key(0, &["abcde", "fghi"]).label_in(BackupKind::Manual, &Utc);
        assert!(exactly_ten.starts_with("abcde,fghi -- "));

        let eleven = key(0, &["abcde", "fghij"]).label_in(BackupKind::Manual, &Utc);
        assert!(eleven.starts_with("abcde,fg... -- "));

        let empty = key(0, &[]).label_in(BackupKind::Automatic, &Utc);
        assert!(empty.starts_with(" -- Thursday"));
    }

    #[test]
    fn test_label_counts_characters_not_bytes() {
        let label = key(0, &["αβγδεζηθικ"]).label_in(BackupKind::Manual, &Utc);
        assert!(label.starts_with("αβγδεζηθικ -- "));
    }

    #[test]
    fn test_created_at() {
        let created = key(1_700_000_000_000, &[]).created_at().unwrap();
        assert_eq!(created.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_entry_label_falls_back_to_computed() {
        let entry = BackupEntry {
            kind: BackupKind::Automatic,
            key: key(0, &["m"]),
        };
        assert!(entry.label().ends_with("-- AUTO"));
        assert_eq!(entry.store_key().kind_name(), "automatic");

        let labelled = BackupEntry {
            kind: BackupKind::Manual,
            key: BackupKey {
                label: Some("custom".into()),
                ..key(0, &["m"])
            },
        };
        assert_eq!(labelled.label(), "custom");
    }

    #[test]
    fn test_kind_names_match_type_tags() {
        let keys = [
            StoreKey::Version,
            StoreKey::backup(BackupKind::Automatic, key(1, &[])),
            StoreKey::backup(BackupKind::Manual, key(1, &[])),
            StoreKey::mtz_data("a.mtz"),
            StoreKey::map_data("u"),
        ];
        for store_key in keys {
            let value: serde_json::Value =
                serde_json::from_str(&store_key.to_key_string().unwrap()).unwrap();
            assert_eq!(value["type"], store_key.kind_name());
        }
    }

    #[test]
    fn test_data_file_name_only_for_data_keys() {
        assert_eq!(StoreKey::mtz_data("a.mtz").data_file_name(), Some("a.mtz"));
        assert_eq!(StoreKey::Version.data_file_name(), None);
        assert!(StoreKey::Version.as_backup().is_none());
    }
}
