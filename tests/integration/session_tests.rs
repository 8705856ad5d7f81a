//! Driving sessions through advice chains.

use std::sync::{Arc, Mutex};

use bandsaw::advice::{Advice, Extension, Instruction};
use bandsaw::models::{ExceptionValue, TaskResult, Value};
use bandsaw::moderator::Stage;
use bandsaw::session::{Progress, Session};
use bandsaw::task::FnTask;
use bandsaw::{BandsawError, Result};

use super::test_helpers::{answer_task, entries, log, registry, session, Log, Recorder};

#[test]
fn chain_wraps_task_in_stack_order() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared).shared(),
                Recorder::new("B", &shared).shared(),
            ],
        );
    });

    let result = session(&registry, "chain").initiate().unwrap();
    assert_eq!(result, TaskResult::value(42));
    assert_eq!(
        entries(&calls),
        ["A.before", "B.before", "task", "B.after", "A.after"]
    );
}

#[test]
fn default_chain_runs_the_task_alone() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared));
    });
    let mut session = bandsaw::session::Session::for_task(
        Arc::clone(&registry),
        "conf",
        "answer",
        super::test_helpers::execution(),
    )
    .unwrap();
    assert_eq!(session.initiate().unwrap(), TaskResult::value(42));
    assert_eq!(entries(&calls), ["task"]);
}

#[test]
fn concluding_before_skips_task_and_inner_advices() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared)
                    .on_before(Instruction::Conclude(TaskResult::value(7)))
                    .shared(),
                Recorder::new("B", &shared).shared(),
            ],
        );
    });

    let result = session(&registry, "chain").initiate().unwrap();
    assert_eq!(result, TaskResult::value(7));
    assert_eq!(entries(&calls), ["A.before", "A.after"]);
}

#[test]
fn skipping_from_any_advice_runs_only_entered_afters() {
    const LEN: usize = 4;
    for skipping in 0..LEN {
        let calls = log();
        let shared = Arc::clone(&calls);
        let registry = registry(move |configuration| {
            let chain = (0..LEN)
                .map(|index| {
                    let recorder = Recorder::new(&index.to_string(), &shared);
                    if index == skipping {
                        recorder
                            .on_before(Instruction::Conclude(TaskResult::value(-1)))
                            .shared()
                    } else {
                        recorder.shared()
                    }
                })
                .collect();
            configuration
                .add_task(answer_task(&shared))
                .add_advice_chain("chain", chain);
        });

        let result = session(&registry, "chain").initiate().unwrap();
        assert_eq!(result, TaskResult::value(-1));

        let mut expected: Vec<String> =
            (0..=skipping).map(|index| format!("{index}.before")).collect();
        expected.extend((0..=skipping).rev().map(|index| format!("{index}.after")));
        assert_eq!(entries(&calls), expected, "skipping from advice {skipping}");
    }
}

#[test]
fn skip_without_result_finishes_without_result() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![Recorder::new("A", &shared)
                .on_before(Instruction::Skip)
                .shared()],
        );
    });

    let mut session = session(&registry, "chain");
    assert!(matches!(
        session.initiate(),
        Err(BandsawError::IllegalState(msg)) if msg.contains("without a result")
    ));
    assert_eq!(entries(&calls), ["A.before", "A.after"]);
    assert!(session.moderator().unwrap().is_finished());
}

#[test]
fn after_hooks_can_replace_the_result() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared).shared(),
                Recorder::new("B", &shared)
                    .on_after(Instruction::Conclude(TaskResult::value("replaced")))
                    .shared(),
            ],
        );
    });

    let result = session(&registry, "chain").initiate().unwrap();
    assert_eq!(result, TaskResult::value("replaced"));
    assert_eq!(
        entries(&calls),
        ["A.before", "B.before", "task", "B.after", "A.after"]
    );
}

#[test]
fn task_failures_are_returned_as_results() {
    let registry = registry(|configuration| {
        configuration.add_task(FnTask::new("answer", |_| {
            Err(ExceptionValue::new("app", "Broken", vec![Value::from("nope")]))
        }));
    });

    let result = session(&registry, "default").initiate().unwrap();
    let err = result.into_result().unwrap_err();
    assert_eq!(err.type_name, "Broken");
    assert_eq!(err.to_string(), "Broken: nope");
}

#[test]
fn suspending_while_initiating_is_misbehaving() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared).shared(),
                Recorder::new("Stuck", &shared)
                    .on_before(Instruction::Suspend)
                    .shared(),
            ],
        );
    });

    let err = session(&registry, "chain").initiate().unwrap_err();
    assert!(matches!(err, BandsawError::MisbehavingAdvice(msg) if msg.contains("Stuck")));
    assert_eq!(entries(&calls), ["A.before", "Stuck.before"]);
}

#[derive(Debug)]
struct Failing;

impl Advice for Failing {
    fn before(&self, _session: &mut Session) -> Result<Instruction> {
        Err(BandsawError::IllegalState("advice failed".into()))
    }
}

#[test]
fn advice_errors_abort_the_session() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration
            .add_task(answer_task(&shared))
            .add_advice_chain("chain", vec![Arc::new(Failing) as Arc<dyn Advice>]);
    });
    let err = session(&registry, "chain").initiate().unwrap_err();
    assert_eq!(err, BandsawError::IllegalState("advice failed".into()));
    assert!(entries(&calls).is_empty());
}

#[test]
fn initiating_twice_fails() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared));
    });
    let mut session = session(&registry, "default");
    session.initiate().unwrap();
    assert!(matches!(
        session.initiate(),
        Err(BandsawError::IllegalState(_))
    ));
    assert!(matches!(session.proceed(), Err(BandsawError::IllegalState(_))));
    assert_eq!(entries(&calls), ["task"]);
}

#[test]
fn unknown_chain_is_rejected() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let err = Session::for_task(
        Arc::clone(&registry),
        "conf",
        "answer",
        super::test_helpers::execution(),
    )
    .unwrap()
    .with_advice_chain("nope")
    .unwrap_err();
    assert!(matches!(err, BandsawError::UnknownChain(_)));
}

#[test]
fn proceed_before_initiate_fails() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let mut session = session(&registry, "default");
    assert!(matches!(session.proceed(), Err(BandsawError::IllegalState(_))));
    assert!(matches!(
        session.conclude(TaskResult::value(1)),
        Err(BandsawError::IllegalState(_))
    ));
}

#[derive(Debug)]
struct Hooks {
    log: Log,
}

impl Extension for Hooks {
    fn on_session_created(&self, session: &mut Session) -> Result<()> {
        self.log.lock().unwrap().push("created".into());
        session.context_mut().insert("extension", true);
        Ok(())
    }

    fn on_session_finished(&self, session: &mut Session) -> Result<()> {
        let result = session.result().cloned();
        self.log
            .lock()
            .unwrap()
            .push(format!("finished {:?}", result.and_then(|r| r.as_value().cloned())));
        Ok(())
    }
}

#[test]
fn extensions_wrap_the_whole_advising() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration
            .add_task(answer_task(&shared))
            .add_extension(Arc::new(Hooks {
                log: Arc::clone(&shared),
            }))
            .add_advice_chain("chain", vec![Recorder::new("A", &shared).shared()]);
    });

    let mut session = session(&registry, "chain");
    session.initiate().unwrap();
    assert_eq!(
        entries(&calls),
        [
            "created",
            "A.before",
            "task",
            "A.after",
            "finished Some(Int(42))"
        ]
    );
    assert_eq!(session.context().get("extension"), Some(&Value::Bool(true)));
}

/// Saves the session into a shared buffer every time its `before` runs.
#[derive(Debug)]
struct Snapshot {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Advice for Snapshot {
    fn name(&self) -> &str {
        "Snapshot"
    }

    fn before(&self, session: &mut Session) -> Result<Instruction> {
        session.context_mut().insert("snapshot", "taken");
        let mut buffer = self.buffer.lock().unwrap();
        buffer.clear();
        session.save(&mut *buffer)?;
        Ok(Instruction::Proceed)
    }
}

fn snapshot_registry(calls: &Log, buffer: &Arc<Mutex<Vec<u8>>>) -> Arc<bandsaw::config::Registry> {
    let shared = Arc::clone(calls);
    let buffer = Arc::clone(buffer);
    registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared).shared(),
                Arc::new(Snapshot {
                    buffer: Arc::clone(&buffer),
                }),
                Recorder::new("C", &shared).shared(),
            ],
        );
    })
}

#[test]
fn mid_chain_snapshot_resumes_to_the_same_result() {
    let calls = log();
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let registry = snapshot_registry(&calls, &buffer);

    let mut original = session(&registry, "chain");
    let expected = original.initiate().unwrap();
    calls.lock().unwrap().clear();

    let snapshot = buffer.lock().unwrap().clone();
    let mut resumed = Session::load(Arc::clone(&registry), snapshot.as_slice()).unwrap();
    assert_eq!(resumed.ids(), original.ids());
    assert_eq!(resumed.moderator().unwrap().stage(), Stage::RunningBefore(2));
    assert_eq!(
        resumed.context().get("snapshot"),
        Some(&Value::from("taken"))
    );
    assert!(resumed.result().is_none());

    assert_eq!(resumed.resume().unwrap(), Progress::Finished);
    assert_eq!(resumed.result(), Some(&expected));
    assert_eq!(entries(&calls), ["C.before", "task", "C.after", "A.after"]);
}

#[test]
fn restore_overwrites_a_finished_session() {
    let calls = log();
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let registry = snapshot_registry(&calls, &buffer);

    let mut session = session(&registry, "chain");
    session.initiate().unwrap();
    assert!(session.moderator().unwrap().is_finished());

    let snapshot = buffer.lock().unwrap().clone();
    session.restore(snapshot.as_slice()).unwrap();
    assert!(!session.moderator().unwrap().is_finished());
    assert!(session.result().is_none());
    assert_eq!(session.resume().unwrap(), Progress::Finished);
    assert_eq!(session.result(), Some(&TaskResult::value(42)));
}

#[test]
fn failed_restore_leaves_state_untouched() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let mut session = session(&registry, "default");
    session.context_mut().insert("kept", 1);
    assert!(session.restore(&b"not a tar archive"[..]).is_err());
    assert_eq!(session.context().get("kept"), Some(&Value::Int(1)));
    assert!(session.moderator().is_none());
}

#[test]
fn unstarted_and_finished_sessions_round_trip() {
    let registry = registry(|configuration| {
        configuration
            .add_task(answer_task(&log()))
            .set_serializer_kind(bandsaw::serialization::SerializerKind::Binary);
    });

    let mut session = session(&registry, "default");
    let mut unstarted = Vec::new();
    session.save(&mut unstarted).unwrap();
    let mut loaded = Session::load(Arc::clone(&registry), unstarted.as_slice()).unwrap();
    assert!(loaded.moderator().is_none());
    assert!(matches!(loaded.resume(), Err(BandsawError::IllegalState(_))));

    session.initiate().unwrap();
    let mut finished = Vec::new();
    session.save(&mut finished).unwrap();
    let mut loaded = Session::load(Arc::clone(&registry), finished.as_slice()).unwrap();
    assert!(loaded.moderator().unwrap().is_finished());
    assert_eq!(loaded.result(), Some(&TaskResult::value(42)));
    assert!(matches!(loaded.proceed(), Err(BandsawError::IllegalState(_))));
}

#[test]
fn attachments_travel_with_the_session() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("report.csv");
    std::fs::write(&file, "a,b\n1,2\n").unwrap();

    let mut session = session(&registry, "default");
    session.attachments_mut().insert("report.csv", &file).unwrap();
    let mut saved = Vec::new();
    session.save(&mut saved).unwrap();
    drop(dir);

    let loaded = Session::load(Arc::clone(&registry), saved.as_slice()).unwrap();
    let attachment = loaded.attachments().get("report.csv").unwrap();
    assert_eq!(attachment.read_all().unwrap(), b"a,b\n1,2\n");
    assert_eq!(attachment.size().unwrap(), 8);
}

#[test]
fn loading_needs_the_registered_configuration_and_task() {
    let source = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let mut saved = Vec::new();
    session(&source, "default").save(&mut saved).unwrap();

    let empty = Arc::new(bandsaw::config::Registry::new());
    assert!(matches!(
        Session::load(empty, saved.as_slice()),
        Err(BandsawError::UnknownConfiguration(_))
    ));

    let without_task = registry(|_| {});
    assert!(matches!(
        Session::load(without_task, saved.as_slice()),
        Err(BandsawError::UnknownTask(_))
    ));
}

#[test]
fn chain_length_change_is_detected_on_load() {
    let calls = log();
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let registry = snapshot_registry(&calls, &buffer);
    session(&registry, "chain").initiate().unwrap();
    let snapshot = buffer.lock().unwrap().clone();

    let shorter = super::test_helpers::registry(move |configuration| {
        configuration
            .add_task(answer_task(&log()))
            .add_advice_chain("chain", Vec::new());
    });
    assert!(matches!(
        Session::load(shorter, snapshot.as_slice()),
        Err(BandsawError::IllegalState(_))
    ));
}

#[test]
fn temp_dir_is_created_lazily_below_the_temp_root() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let mut session = session(&registry, "default");
    let dir = session.temp_dir().unwrap();
    assert!(dir.is_dir());
    assert!(dir.starts_with(session.configuration().temp_root()));
    assert!(dir.ends_with(session.ids().as_path()));
    assert_eq!(session.temp_dir().unwrap(), dir);
}

#[test]
fn context_holds_rich_values_across_save() {
    let registry = registry(|configuration| {
        configuration.add_task(answer_task(&log()));
    });
    let mut session = session(&registry, "default");
    session.context_mut().insert(
        "error",
        ExceptionValue::new("app", "Broken", vec![Value::Bytes(vec![1, 2])]),
    );
    let mut saved = Vec::new();
    session.save(&mut saved).unwrap();
    let loaded = Session::load(Arc::clone(&registry), saved.as_slice()).unwrap();
    assert_eq!(loaded.context(), session.context());
}

#[test]
fn ids_with_underscores_survive_save_and_load() {
    let shared = log();
    let mut registry = bandsaw::config::Registry::new().with_run_id("run_1");
    registry.register("conf", move || {
        let mut configuration = bandsaw::config::Configuration::new("conf")?;
        configuration.add_task(answer_task(&shared));
        Ok(configuration)
    });
    let registry = Arc::new(registry);
    let execution = bandsaw::models::Execution::new(
        "exec_1",
        vec![Value::Int(1)],
        std::collections::BTreeMap::new(),
    );
    let mut session =
        Session::for_task(Arc::clone(&registry), "conf", "answer", execution).unwrap();
    assert_eq!(session.session_id(), "answer_exec_1_run_1");

    let mut saved = Vec::new();
    session.save(&mut saved).unwrap();
    let mut loaded = Session::load(Arc::clone(&registry), saved.as_slice()).unwrap();
    assert_eq!(loaded.ids(), session.ids());
    assert_eq!(loaded.run_id(), "run_1");
    assert_eq!(loaded.ids().execution_id, "exec_1");
    assert_eq!(loaded.temp_dir().unwrap(), session.temp_dir().unwrap());
}

#[test]
fn saving_during_after_phase_keeps_result_and_counters() {
    let calls = log();
    let shared = Arc::clone(&calls);
    let registry = registry(move |configuration| {
        configuration.add_task(answer_task(&shared)).add_advice_chain(
            "chain",
            vec![
                Recorder::new("A", &shared).shared(),
                Recorder::new("B", &shared).shared(),
            ],
        );
    });

    let mut session = session(&registry, "chain");
    session.start().unwrap();
    for _ in 0..4 {
        assert_eq!(session.proceed().unwrap(), Progress::Running);
    }
    assert_eq!(entries(&calls), ["A.before", "B.before", "task", "B.after"]);
    assert_eq!(session.moderator().unwrap().stage(), Stage::RunningAfter(1));

    let mut saved = Vec::new();
    session.save(&mut saved).unwrap();
    calls.lock().unwrap().clear();

    let mut loaded = Session::load(Arc::clone(&registry), saved.as_slice()).unwrap();
    let state = loaded.moderator().unwrap().state();
    assert_eq!(state, session.moderator().unwrap().state());
    assert_eq!(state.before_called, 2);
    assert_eq!(state.after_called, 1);
    assert!(state.task_called);
    assert!(!state.is_finished);
    assert_eq!(loaded.result(), Some(&TaskResult::value(42)));

    assert_eq!(loaded.resume().unwrap(), Progress::Finished);
    assert_eq!(entries(&calls), ["A.after"]);
    assert_eq!(loaded.result(), Some(&TaskResult::value(42)));
}
