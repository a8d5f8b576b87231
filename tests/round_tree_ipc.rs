use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_evald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn sample_tree() -> serde_json::Value {
    json!({
        "roundId": 25671,
        "startDate": "2024-06-01",
        "endDate": "2024-07-15",
        "minScore": 1.0,
        "maxScore": 5.0,
        "sections": [
            {
                "section1": 1,
                "kind": "description",
                "title": "คำชี้แจง",
                "body": "โปรดประเมินตามความเป็นจริง",
                "topics": []
            },
            {
                "section1": 2,
                "kind": "questions",
                "title": "การสอน",
                "topics": [
                    {
                        "sectionOrdinal": 2,
                        "topicOrdinal": 1,
                        "text": "ด้านเนื้อหา",
                        "items": [
                            { "kind": "scale", "text": "เนื้อหาชัดเจน" },
                            { "kind": "scale", "text": "เนื้อหาทันสมัย" }
                        ]
                    },
                    {
                        "sectionOrdinal": 2,
                        "topicOrdinal": 2,
                        "text": "ด้านผู้สอน",
                        "items": [
                            { "kind": "scale", "text": "ตรงต่อเวลา" },
                            { "kind": "text", "text": "ข้อเสนอแนะ" }
                        ]
                    }
                ]
            }
        ]
    })
}

#[test]
fn create_get_round_trip_preserves_structure() {
    let workspace = temp_dir("evald-round-tree");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(&mut stdin, &mut reader, "2", "round.create", json!({ "tree": sample_tree() }));
    assert_eq!(created.get("roundId").and_then(|v| v.as_i64()), Some(25671));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "round.get",
        json!({ "roundId": 25671 }),
    );
    assert_eq!(
        got.get("diagnostics").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let tree = got.get("tree").expect("tree");
    assert_eq!(tree.get("startDate").and_then(|v| v.as_str()), Some("2024-06-01"));
    assert_eq!(tree.get("minScore").and_then(|v| v.as_f64()), Some(1.0));

    let sections = tree.get("sections").and_then(|v| v.as_array()).expect("sections");
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].get("kind").and_then(|v| v.as_str()), Some("description"));
    assert_eq!(
        sections[0].get("body").and_then(|v| v.as_str()),
        Some("โปรดประเมินตามความเป็นจริง")
    );

    let topics = sections[1].get("topics").and_then(|v| v.as_array()).expect("topics");
    assert_eq!(topics.len(), 2);
    for (i, topic) in topics.iter().enumerate() {
        assert_eq!(
            topic.get("topicOrdinal").and_then(|v| v.as_i64()),
            Some(i as i64 + 1)
        );
        let items = topic.get("items").and_then(|v| v.as_array()).expect("items");
        assert_eq!(items.len(), 2);
        for item in items {
            assert!(!item
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .is_empty());
        }
    }
    // Scale leaves carry the denormalized round scale; text leaves do not.
    let scale_item = &topics[0]["items"][0];
    assert_eq!(scale_item.get("minScore").and_then(|v| v.as_f64()), Some(1.0));
    assert_eq!(scale_item.get("maxScore").and_then(|v| v.as_f64()), Some(5.0));
    let text_item = &topics[1]["items"][1];
    assert_eq!(text_item.get("kind").and_then(|v| v.as_str()), Some("text"));
    assert!(text_item.get("minScore").map(|v| v.is_null()).unwrap_or(true));

    let listed = request_ok(&mut stdin, &mut reader, "4", "rounds.list", json!({}));
    let rounds = listed.get("rounds").and_then(|v| v.as_array()).expect("rounds");
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].get("roundId").and_then(|v| v.as_i64()), Some(25671));
    assert_eq!(rounds[0].get("sectionCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(rounds[0].get("questionCount").and_then(|v| v.as_i64()), Some(4));

    let _ = child.kill();
}

#[test]
fn description_only_round_keeps_its_dates() {
    let workspace = temp_dir("evald-round-desc-dates");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // A round with no question rows at all; the dates and bounds must
    // survive the store round-trip anyway.
    let tree = json!({
        "roundId": 25671,
        "startDate": "2024-06-01",
        "endDate": "2024-07-15",
        "minScore": 1.0,
        "maxScore": 5.0,
        "sections": [
            {
                "section1": 1,
                "kind": "description",
                "title": "คำชี้แจง",
                "body": "รอบนี้ไม่มีคำถาม",
                "topics": []
            }
        ]
    });
    let _ = request_ok(&mut stdin, &mut reader, "2", "round.create", json!({ "tree": tree }));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "round.get",
        json!({ "roundId": 25671 }),
    );
    assert_eq!(
        got.pointer("/tree/startDate").and_then(|v| v.as_str()),
        Some("2024-06-01")
    );
    assert_eq!(
        got.pointer("/tree/endDate").and_then(|v| v.as_str()),
        Some("2024-07-15")
    );
    assert_eq!(got.pointer("/tree/minScore").and_then(|v| v.as_f64()), Some(1.0));
    assert_eq!(got.pointer("/tree/maxScore").and_then(|v| v.as_f64()), Some(5.0));

    let listed = request_ok(&mut stdin, &mut reader, "4", "rounds.list", json!({}));
    let rounds = listed.get("rounds").and_then(|v| v.as_array()).expect("rounds");
    assert_eq!(rounds[0].get("startDate").and_then(|v| v.as_str()), Some("2024-06-01"));
    assert_eq!(rounds[0].get("questionCount").and_then(|v| v.as_i64()), Some(0));

    let _ = child.kill();
}

#[test]
fn duplicate_round_id_is_rejected() {
    let workspace = temp_dir("evald-round-dup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "round.create", json!({ "tree": sample_tree() }));

    let resp = request(&mut stdin, &mut reader, "3", "round.create", json!({ "tree": sample_tree() }));
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("duplicate_round")
    );

    // The first round's rows are untouched.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "round.get",
        json!({ "year": 2567, "term": 1 }),
    );
    let sections = got.pointer("/tree/sections").and_then(|v| v.as_array()).expect("sections");
    assert_eq!(sections.len(), 2);

    let _ = child.kill();
}

#[test]
fn missing_round_reports_not_found() {
    let workspace = temp_dir("evald-round-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "round.get",
        json!({ "roundId": 99999 }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = child.kill();
}
