//! Integration tests for the deferred access queue: ordering, exactly-once
//! execution, cancellation, failure routing and automatic push.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use session_runtime::{
    AccessError, PushConnection, PushMode, Request, RequestKind, Response, Session, SessionError, TaskStatus,
};

use common::{bootstrap, record_errors, service, service_with, wait_until, RecordingPush};

// ── Ordering and execution ──────────────────────────────────────

#[test]
fn queued_tasks_run_in_submission_order_on_unlock() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let order = Arc::new(Mutex::new(Vec::new()));

    let guard = session.lock_guard();
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let order = order.clone();
            session.access(move || {
                order.lock().push(i);
                Ok(())
            })
        })
        .collect();
    assert!(order.lock().is_empty(), "nothing runs while the submitter holds the lock");
    assert_eq!(session.pending_access_count(), 10);
    drop(guard);

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(session.pending_access_count(), 0);
    for handle in handles {
        assert_eq!(handle.status(), TaskStatus::Done);
    }
}

#[test]
fn tasks_from_different_threads_run_in_submission_order() {
    const SUBMITTERS: usize = 20;

    let svc = service();
    let (session, _) = bootstrap(&svc);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let session = session.clone();
        thread::spawn(move || {
            session.with_lock(|_| {
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        })
    };
    locked_rx.recv().unwrap();

    for i in 0..SUBMITTERS {
        let session = session.clone();
        let order = order.clone();
        thread::spawn(move || {
            session.access(move || {
                order.lock().push(i);
                Ok(())
            })
        })
        .join()
        .unwrap();
    }
    assert!(order.lock().is_empty(), "nothing runs while the holder keeps the lock");
    assert_eq!(session.pending_access_count(), SUBMITTERS);

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert_eq!(*order.lock(), (0..SUBMITTERS).collect::<Vec<_>>());
}

#[test]
fn access_runs_immediately_when_lock_is_free() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let handle = session.access(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(handle.is_done());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_producers_each_task_runs_exactly_once() {
    const PRODUCERS: usize = 8;
    const TASKS: usize = 200;

    let svc = service();
    let (session, _) = bootstrap(&svc);
    let runs = Arc::new(AtomicUsize::new(0));
    let per_producer = Arc::new(Mutex::new(vec![Vec::new(); PRODUCERS]));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let session = session.clone();
            let runs = runs.clone();
            let per_producer = per_producer.clone();
            thread::spawn(move || {
                let mut handles = Vec::with_capacity(TASKS);
                for i in 0..TASKS {
                    let runs = runs.clone();
                    let per_producer = per_producer.clone();
                    handles.push(session.access(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        per_producer.lock()[p].push(i);
                        Ok(())
                    }));
                    if i % 50 == 0 {
                        // Interleave with a thread that holds the lock directly.
                        session.with_lock(|_| thread::yield_now());
                    }
                }
                handles
            })
        })
        .collect();

    let handles: Vec<_> = producers.into_iter().flat_map(|p| p.join().unwrap()).collect();
    for handle in &handles {
        handle.get_timeout(Duration::from_secs(10)).expect("task completes");
    }

    assert_eq!(runs.load(Ordering::SeqCst), PRODUCERS * TASKS);
    for (p, seen) in per_producer.lock().iter().enumerate() {
        assert_eq!(*seen, (0..TASKS).collect::<Vec<_>>(), "producer {p} tasks ran out of order");
    }
    assert_eq!(session.pending_access_count(), 0);
}

// ── Cancellation ────────────────────────────────────────────────

#[test]
fn cancel_before_run_skips_the_command() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let ran = Arc::new(AtomicUsize::new(0));

    let guard = session.lock_guard();
    let counter = ran.clone();
    let handle = session.access(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert!(handle.is_done());
    drop(guard);

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.status(), TaskStatus::Cancelled);
    assert!(matches!(handle.get(), Err(AccessError::Cancelled)));
}

#[test]
fn cancel_after_completion_has_no_effect() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let handle = session.access(|| Ok(()));
    assert!(handle.is_done());
    assert!(!handle.cancel());
    assert_eq!(handle.status(), TaskStatus::Done);
    assert!(handle.get().is_ok());
}

#[test]
fn cancel_while_running_does_not_interrupt() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let drainer = {
        let session = session.clone();
        let (s, r) = (started.clone(), release.clone());
        thread::spawn(move || {
            let guard = session.lock_guard();
            let handle = session.access(move || {
                s.store(1, Ordering::SeqCst);
                while r.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });
            tx.send(handle).unwrap();
            drop(guard);
        })
    };

    let handle = rx.recv().unwrap();
    assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
    assert_eq!(handle.status(), TaskStatus::Running);
    assert!(!handle.cancel(), "a running task cannot be cancelled");
    release.store(1, Ordering::SeqCst);
    drainer.join().unwrap();
    assert_eq!(handle.status(), TaskStatus::Done);
}

// ── Failures ────────────────────────────────────────────────────

#[test]
fn failing_task_reaches_error_handler_and_handle() {
    let svc = service();
    let (session, ui) = bootstrap(&svc);
    let errors = record_errors(&session);

    let target = session.with_lock(|s| s.ui(ui).unwrap().unwrap());
    let failing = target.access(|| anyhow::bail!("render failed")).unwrap();
    let panicking = session.access(|| panic!("boom"));
    let following = session.access(|| Ok(()));

    match failing.get() {
        Err(AccessError::Failed(e)) => assert!(e.to_string().contains("render failed")),
        other => panic!("expected failure, got {other:?}"),
    }
    match panicking.get() {
        Err(e) => assert!(e.failure().unwrap().to_string().contains("boom")),
        Ok(()) => panic!("panicking task reported success"),
    }
    assert!(following.get().is_ok(), "a failure never stops the drain");

    let seen = errors.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("render failed"));
    assert!(seen[1].contains("boom"));
}

#[test]
fn ui_access_after_removal_fails_with_detached() {
    let svc = service();
    let (session, ui) = bootstrap(&svc);
    let target = session.with_lock(|s| s.ui(ui).unwrap().unwrap());

    let guard = session.lock_guard();
    let handle = target.access(|| Ok(())).unwrap();
    session.remove_ui(ui).unwrap();
    drop(guard);

    match handle.get() {
        Err(AccessError::Failed(e)) => {
            assert!(matches!(e.downcast_ref::<SessionError>(), Some(SessionError::UiDetached)))
        }
        other => panic!("expected detached failure, got {other:?}"),
    }
    assert!(matches!(target.access(|| Ok(())), Err(SessionError::UiDetached)));
}

// ── Synchronous access ──────────────────────────────────────────

#[test]
fn access_synchronously_waits_for_the_lock_holder() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let order = Arc::new(Mutex::new(Vec::new()));
    let holding = Arc::new(AtomicUsize::new(0));

    let holder = {
        let session = session.clone();
        let order = order.clone();
        let holding = holding.clone();
        thread::spawn(move || {
            session.with_lock(|_| {
                holding.store(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                order.lock().push("holder");
            })
        })
    };
    assert!(wait_until(Duration::from_secs(5), || holding.load(Ordering::SeqCst) == 1));

    let o = order.clone();
    session
        .access_synchronously(move || {
            o.lock().push("sync");
            Ok(())
        })
        .unwrap();
    holder.join().unwrap();
    assert_eq!(*order.lock(), vec!["holder", "sync"]);
}

#[test]
fn access_synchronously_reports_failures_to_caller() {
    let svc = service();
    let (session, _) = bootstrap(&svc);
    let result = session.access_synchronously(|| anyhow::bail!("nope"));
    assert!(matches!(result, Err(AccessError::Failed(_))));
    assert!(!session.has_lock());
}

// ── Push ────────────────────────────────────────────────────────

#[test]
fn automatic_push_flushes_changes_when_lock_is_released() {
    let svc = service_with(|c| c.default_push_mode = PushMode::Automatic);
    let recorder = Arc::new(RecordingPush::default());
    let conn = recorder.clone();
    svc.set_push_connection_factory(move |_, _| Some(conn.clone() as Arc<dyn PushConnection>));
    let (session, ui) = bootstrap(&svc);

    let s = session.clone();
    let producer = thread::spawn(move || {
        let target = s.clone();
        s.access(move || {
            target.ui(ui)?.expect("ui exists").mark_changed("counter=1")?;
            Ok(())
        })
    });
    producer.join().unwrap().get().unwrap();

    assert_eq!(recorder.all_changes(), vec!["counter=1".to_string()]);
    session.with_lock(|s| assert!(s.ui(ui).unwrap().unwrap().pending_changes().unwrap().is_empty()));
}

#[test]
fn task_queued_during_a_request_runs_and_pushes_before_the_next_request() {
    let svc = service_with(|c| c.default_push_mode = PushMode::Automatic);
    let recorder = Arc::new(RecordingPush::default());
    let conn = recorder.clone();
    svc.set_push_connection_factory(move |_, _| Some(conn.clone() as Arc<dyn PushConnection>));

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let in_slow = Arc::new(AtomicUsize::new(0));
    {
        let (log, in_slow, recorder) = (log.clone(), in_slow.clone(), recorder.clone());
        svc.add_request_handler(move |_: &Session, request: &Request, _: &mut Response| {
            match &request.kind {
                RequestKind::Other(path) if path == "/slow" => {
                    in_slow.store(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    log.lock().push("slow-done".into());
                    Ok(true)
                }
                RequestKind::Other(path) if path == "/next" => {
                    log.lock().push(format!("next pushed={}", recorder.all_changes().len()));
                    Ok(true)
                }
                _ => Ok(false),
            }
        });
    }
    let (session, ui) = bootstrap(&svc);
    let transport = session.transport().unwrap().id();

    let slow = {
        let svc = svc.clone();
        thread::spawn(move || svc.handle_request(&Request::new(RequestKind::Other("/slow".into())).with_transport(transport)))
    };
    assert!(wait_until(Duration::from_secs(5), || in_slow.load(Ordering::SeqCst) == 1));

    let target = session.clone();
    let cmd_log = log.clone();
    let handle = session.access(move || {
        cmd_log.lock().push("cmd".into());
        target.ui(ui)?.expect("ui exists").mark_changed("x")?;
        Ok(())
    });
    assert_eq!(handle.status(), TaskStatus::Pending, "the request still holds the lock");

    let next = {
        let svc = svc.clone();
        thread::spawn(move || svc.handle_request(&Request::new(RequestKind::Other("/next".into())).with_transport(transport)))
    };
    assert!(slow.join().unwrap().is_ok());
    assert!(next.join().unwrap().is_ok());
    handle.get().unwrap();

    assert_eq!(*log.lock(), vec!["slow-done", "cmd", "next pushed=1"]);
    assert_eq!(recorder.all_changes(), vec!["x".to_string()]);
}

#[test]
fn manual_push_only_sends_on_request() {
    let svc = service_with(|c| c.default_push_mode = PushMode::Manual);
    let recorder = Arc::new(RecordingPush::default());
    let conn = recorder.clone();
    svc.set_push_connection_factory(move |_, _| Some(conn.clone() as Arc<dyn PushConnection>));
    let (session, ui) = bootstrap(&svc);

    session.with_lock(|s| s.ui(ui).unwrap().unwrap().mark_changed("a").unwrap());
    assert!(recorder.all_changes().is_empty(), "manual mode does not push on unlock");

    let pushed = session.with_lock(|s| s.ui(ui).unwrap().unwrap().push().unwrap());
    assert!(pushed);
    assert_eq!(recorder.all_changes(), vec!["a".to_string()]);
}

#[test]
fn push_requires_push_enabled() {
    let svc = service();
    let (session, ui) = bootstrap(&svc);
    let result = session.with_lock(|s| s.ui(ui).unwrap().unwrap().push());
    assert!(matches!(result, Err(SessionError::PushDisabled(id)) if id == ui));
}
