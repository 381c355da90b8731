// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::io::{Seek, SeekFrom};

fn sample(n: u32) -> HostRecord {
    HostRecord {
        id: format!("srv-{}", n),
        name: format!("muster-host-{}", n),
        ip: format!("192.168.0.{}", n),
        flavor: Flavor::new("f2", "m1.large", 4, 16_384, 100),
        key_ref: "muster-key".to_string(),
        namespace: if n % 2 == 0 { String::new() } else { "muster-ns".to_string() },
    }
}

#[test]
fn records_round_trip_through_a_file() {
    let records: Vec<HostRecord> = (1..=5).map(sample).collect();

    let mut file = tempfile::tempfile().unwrap();
    write_records(&mut file, &records).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let loaded = read_records(&mut file).unwrap();
    assert_eq!(loaded, records);
}

#[test]
fn empty_file_reads_as_no_records() {
    let loaded = read_records(std::io::Cursor::new(Vec::new())).unwrap();
    assert!(loaded.is_empty());
}

#[test]
fn truncated_frame_is_an_error() {
    let mut buf = Vec::new();
    write_records(&mut buf, &[sample(1)]).unwrap();
    buf.truncate(buf.len() - 3);
    assert!(read_records(std::io::Cursor::new(buf)).is_err());
}

#[test]
fn missing_namespace_defaults_to_empty() {
    // older records were written before cluster mode existed
    let json = br#"{"id":"srv-1","name":"h","ip":"10.0.0.1","flavor":{"id":"f","name":"n","cores":1,"ram_mb":512,"disk_gb":10},"key_ref":"k"}"#;
    let mut buf = Vec::new();
    buf.extend((json.len() as u32).to_be_bytes());
    buf.extend_from_slice(json);
    let loaded = read_records(std::io::Cursor::new(buf)).unwrap();
    assert_eq!(loaded[0].namespace, "");
}
