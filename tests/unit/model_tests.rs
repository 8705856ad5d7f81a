use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use bandsaw::identifier::identifier_from_bytes;
use bandsaw::models::value::SerializableValue;
use bandsaw::models::{
    Attachments, Context, ExceptionValue, Execution, Ids, TaskResult, Value,
};
use bandsaw::BandsawError;

#[test]
fn session_id_joins_ids_with_underscores() {
    let ids = Ids::new("task", "exec", "run");
    assert_eq!(ids.session_id(), "task_exec_run");
    assert_eq!(ids.to_string(), "task_exec_run");
    assert_eq!(ids.as_path(), PathBuf::from("task").join("exec").join("run"));
}

#[test]
fn ids_parse_from_the_right() {
    let ids: Ids = "my_task_abc123_run9".parse().expect("valid ids");
    assert_eq!(ids, Ids::new("my_task", "abc123", "run9"));
    assert!("only_two".parse::<Ids>().is_err());
    assert!("a__b".parse::<Ids>().is_err());
}

#[test]
fn execution_ids_are_content_derived() {
    let mut kwargs = BTreeMap::new();
    kwargs.insert("unit".to_owned(), Value::from("m"));
    let first = Execution::derive(vec![Value::Int(1)], kwargs.clone()).expect("derive");
    let second = Execution::derive(vec![Value::Int(1)], kwargs).expect("derive");
    let other = Execution::derive(vec![Value::Int(2)], BTreeMap::new()).expect("derive");
    assert_eq!(first.execution_id(), second.execution_id());
    assert_ne!(first.execution_id(), other.execution_id());
    assert_eq!(first.execution_id().len(), 64);
}

#[test]
fn execution_derive_rejects_nan() {
    assert!(Execution::derive(vec![Value::Float(f64::NAN)], BTreeMap::new()).is_err());
}

#[test]
fn identifier_differs_for_different_buffers() {
    assert_ne!(identifier_from_bytes(b"a"), identifier_from_bytes(b"b"));
}

#[test]
fn context_push_appends_to_lists() {
    let mut context = Context::new();
    context.push("log", "one").expect("push");
    context.push("log", "two").expect("push");
    assert_eq!(
        context.get("log"),
        Some(&Value::List(vec![Value::from("one"), Value::from("two")]))
    );

    context.insert("count", 3);
    assert!(matches!(
        context.push("count", 4),
        Err(BandsawError::IllegalState(_))
    ));
}

#[test]
fn context_round_trips_through_its_serialized_form() {
    let mut context = Context::new();
    context.insert("flag", true);
    context.insert(
        "error",
        ExceptionValue::new("m", "Oops", vec![Value::from("x")]),
    );
    let restored = Context::deserialize(context.serialized()).expect("context");
    assert_eq!(restored, context);
}

#[test]
fn task_result_call_site_view() {
    assert_eq!(
        TaskResult::value(5).into_result().expect("value"),
        Value::Int(5)
    );
    let exception = ExceptionValue::new("m", "Oops", Vec::new());
    assert_eq!(
        TaskResult::exception(exception.clone()).into_result().unwrap_err(),
        exception
    );
}

#[test]
fn task_result_serialized_forms() {
    for result in [
        TaskResult::value(Value::List(vec![Value::Null])),
        TaskResult::exception(ExceptionValue::new("m", "Oops", vec![Value::Int(1)])),
    ] {
        assert_eq!(
            TaskResult::deserialize(result.serialized()).expect("result"),
            result
        );
    }
}

#[test]
fn attachments_reject_duplicates_and_bad_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("data.bin");
    std::fs::write(&file, [1_u8, 2, 3]).expect("write");

    let mut attachments = Attachments::new();
    attachments.insert("data", &file).expect("insert");
    assert!(matches!(
        attachments.insert("data", &file),
        Err(BandsawError::Attachment(msg)) if msg.contains("already exist")
    ));
    assert!(attachments.insert("missing", dir.path().join("nope")).is_err());
    assert!(attachments.insert("dir", dir.path()).is_err());
    assert!(attachments.insert("a/b", &file).is_err());
    assert!(attachments.insert("", &file).is_err());
    assert_eq!(attachments.len(), 1);
}

#[test]
fn attachments_open_and_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").expect("write");

    let mut attachments = Attachments::new();
    attachments.insert("notes", &file).expect("insert");
    attachments
        .insert_archived("copy", b"hi".to_vec())
        .expect("insert archived");

    let notes = attachments.get("notes").expect("notes");
    assert_eq!(notes.size().expect("size"), 5);
    let mut content = String::new();
    notes
        .open()
        .expect("open")
        .read_to_string(&mut content)
        .expect("read");
    assert_eq!(content, "hello");
    assert_eq!(
        attachments.get("copy").expect("copy").read_all().expect("read"),
        b"hi"
    );
    let names: Vec<&str> = attachments.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["copy", "notes"]);
}
