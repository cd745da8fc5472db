mod common;

use common::{MASK, ScriptedManager, TIMEOUT};
use crossbeam_channel::bounded;
use std::{error::Error, sync::Arc, thread, time::Duration};
use streamgate::{
    drm::{DecryptCode, DecryptionGate, FatalDecrypt, GateConfig, GateError, SessionState},
    media::{FlowError, MediaBuffer, MediaType},
    notify::{self, ErrorKind, Notices},
    player::DetachedPlayer,
};
use streamgate_cenc::{EncryptedSampleDescriptor, ProtectionSystem, SubsampleRange};

fn gate_with(manager: Arc<ScriptedManager>, config: GateConfig) -> (Arc<DecryptionGate>, Notices) {
    let (notifier, notices) = notify::channel();
    let gate = DecryptionGate::new(
        ProtectionSystem::PlayReady,
        Some(MediaType::Video),
        manager,
        Arc::new(DetachedPlayer),
        notifier,
        config,
    );
    gate.activate();
    (Arc::new(gate), notices)
}

fn bind(gate: &DecryptionGate) {
    gate.on_protection_metadata(ProtectionSystem::PlayReady.system_id(), b"init", None);
}

fn sample() -> EncryptedSampleDescriptor {
    EncryptedSampleDescriptor::new(vec![1; 16], vec![2; 16])
}

fn failures(count: usize) -> Vec<Option<DecryptCode>> {
    vec![Some(DecryptCode::Generic(-3)); count]
}

fn feed(gate: &DecryptionGate, count: usize) -> Vec<Result<(), GateError>> {
    (0..count)
        .map(|_| gate.on_sample(&sample(), &mut MediaBuffer::new(vec![0; 32])))
        .collect()
}

#[test]
fn failures_below_threshold_then_success_reset() -> Result<(), Box<dyn Error>> {
    let (gate, notices) = gate_with(ScriptedManager::new(failures(4)), GateConfig::default());
    bind(&gate);

    let results = feed(&gate, 4);
    assert!(results.iter().all(|r| matches!(r, Err(GateError::DecryptFailed { code: -3 }))));
    assert_eq!(gate.decrypt_failures(), 4);

    gate.on_sample(&sample(), &mut MediaBuffer::new(vec![0; 32]))?;
    assert_eq!(gate.decrypt_failures(), 0);
    assert!(notices.drain_errors().is_empty());
    Ok(())
}

#[test]
fn threshold_reports_exactly_once() -> Result<(), Box<dyn Error>> {
    for extra in [0, 1, 7] {
        let (gate, notices) =
            gate_with(ScriptedManager::new(failures(5 + extra)), GateConfig::default());
        bind(&gate);

        let results = feed(&gate, 5 + extra);
        assert_eq!(
            results[4],
            Err(GateError::Fatal(FatalDecrypt::Decrypt(-3)))
        );
        assert_eq!(results[4].as_ref().unwrap_err().flow(), FlowError::Error);
        for result in &results[5..] {
            assert!(matches!(result, Err(GateError::DecryptFailed { .. })));
        }

        let errors = notices.drain_errors();
        assert_eq!(errors.len(), 1, "extra failures: {}", extra);
        assert_eq!(errors[0].kind, ErrorKind::DecryptFailure);
        assert_eq!(errors[0].message, "Decrypt Error: code -3");
        assert!(gate.error_reported());
    }
    Ok(())
}

#[test]
fn report_latch_survives_success_by_default() -> Result<(), Box<dyn Error>> {
    let mut outcomes = failures(5);
    outcomes.push(None);
    outcomes.extend(failures(5));
    let (gate, notices) = gate_with(ScriptedManager::new(outcomes), GateConfig::default());
    bind(&gate);

    feed(&gate, 11);
    assert_eq!(notices.drain_errors().len(), 1);

    gate.reset();
    assert!(!gate.error_reported());
    assert_eq!(gate.decrypt_failures(), 0);
    Ok(())
}

#[test]
fn report_latch_rearms_when_configured() -> Result<(), Box<dyn Error>> {
    let mut outcomes = failures(5);
    outcomes.push(None);
    outcomes.extend(failures(5));
    let config = GateConfig {
        rearm_error_report_on_success: true,
        ..GateConfig::default()
    };
    let (gate, notices) = gate_with(ScriptedManager::new(outcomes), config);
    bind(&gate);

    feed(&gate, 11);
    assert_eq!(notices.drain_errors().len(), 2);
    Ok(())
}

#[test]
fn compliance_failure_sub_kind() -> Result<(), Box<dyn Error>> {
    let outcomes = vec![Some(DecryptCode::HdcpCompliance); 5];
    let (gate, notices) = gate_with(ScriptedManager::new(outcomes), GateConfig::default());
    bind(&gate);

    feed(&gate, 5);
    let errors = notices.drain_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::HdcpCompliance);
    assert_eq!(errors[0].message, "HDCP Compliance Check Failure");
    Ok(())
}

#[test]
fn mismatched_system_leaves_state() -> Result<(), Box<dyn Error>> {
    let manager = ScriptedManager::new(Vec::new());
    let (gate, _notices) = gate_with(manager.clone(), GateConfig::default());

    gate.on_protection_metadata(ProtectionSystem::Widevine.system_id(), b"init", None);
    gate.on_protection_metadata("sysA", b"init", None);

    assert_eq!(gate.session_state(), SessionState::Unbound);
    assert_eq!(manager.creates.load(std::sync::atomic::Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn zero_subsample_sample_is_one_cipher_block() -> Result<(), Box<dyn Error>> {
    let (gate, _notices) = gate_with(ScriptedManager::new(Vec::new()), GateConfig::default());
    bind(&gate);

    let mut buffer = MediaBuffer::new(vec![0; 1024]);
    gate.on_sample(&sample(), &mut buffer)?;
    assert!(buffer.data.iter().all(|byte| *byte == MASK));
    Ok(())
}

#[test]
fn clear_ranges_are_untouched() -> Result<(), Box<dyn Error>> {
    let (gate, _notices) = gate_with(ScriptedManager::new(Vec::new()), GateConfig::default());
    bind(&gate);

    let descriptor = sample().with_subsamples(vec![
        SubsampleRange::new(4, 4),
        SubsampleRange::new(2, 0),
        SubsampleRange::new(0, 2),
    ]);
    let mut buffer = MediaBuffer::new(vec![0; 12]);
    gate.on_sample(&descriptor, &mut buffer)?;
    assert_eq!(
        buffer.data,
        vec![0, 0, 0, 0, MASK, MASK, MASK, MASK, 0, 0, MASK, MASK]
    );
    Ok(())
}

#[test]
fn sample_waits_for_binding() -> Result<(), Box<dyn Error>> {
    let manager = ScriptedManager::new(Vec::new());
    let (gate, _notices) = gate_with(manager.clone(), GateConfig::default());
    let (tx, rx) = bounded(1);

    let waiter = {
        let gate = gate.clone();
        thread::spawn(move || {
            let mut buffer = MediaBuffer::new(vec![0; 8]);
            let result = gate.on_sample(&sample(), &mut buffer);
            let _ = tx.send((result, buffer));
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(manager.decrypt_calls(), 0);

    bind(&gate);
    let (result, buffer) = rx.recv_timeout(TIMEOUT)?;
    assert_eq!(result, Ok(()));
    assert_eq!(buffer.data, vec![MASK; 8]);
    waiter.join().map_err(|_| "waiter panicked")?;
    Ok(())
}

#[test]
fn shutdown_during_wait_releases_sample() -> Result<(), Box<dyn Error>> {
    let (gate, _notices) = gate_with(ScriptedManager::new(Vec::new()), GateConfig::default());
    let (tx, rx) = bounded(1);

    let waiter = {
        let gate = gate.clone();
        thread::spawn(move || {
            let _ = tx.send(gate.on_sample(&sample(), &mut MediaBuffer::new(vec![0; 8])));
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    gate.deactivate();

    let result = rx.recv_timeout(TIMEOUT)?;
    assert_eq!(result, Err(GateError::KeyWaitAborted));
    assert_eq!(result.unwrap_err().flow(), FlowError::NotSupported);
    waiter.join().map_err(|_| "waiter panicked")?;
    Ok(())
}

#[test]
fn session_failure_releases_waiters() -> Result<(), Box<dyn Error>> {
    let (gate, notices) = gate_with(ScriptedManager::failing(), GateConfig::default());
    let (tx, rx) = bounded(1);

    let waiter = {
        let gate = gate.clone();
        thread::spawn(move || {
            let _ = tx.send(gate.on_sample(&sample(), &mut MediaBuffer::new(vec![0; 8])));
        })
    };

    thread::sleep(Duration::from_millis(20));
    bind(&gate);

    assert_eq!(rx.recv_timeout(TIMEOUT)?, Err(GateError::SessionUnavailable));
    assert_eq!(gate.session_state(), SessionState::Failed);

    let errors = notices.drain_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::SessionCreation);
    assert_eq!(errors[0].code, Some(7));
    waiter.join().map_err(|_| "waiter panicked")?;
    Ok(())
}

#[test]
fn concurrent_metadata_and_samples_never_decrypt_unbound() -> Result<(), Box<dyn Error>> {
    for round in 0..20u64 {
        let manager = ScriptedManager::delayed(Duration::from_millis(round % 4));
        let (gate, _notices) = gate_with(manager.clone(), GateConfig::default());

        let producers = (0..4)
            .map(|i| {
                let gate = gate.clone();
                thread::spawn(move || {
                    if (i + round) % 3 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                    (0..10)
                        .map(|_| gate.on_sample(&sample(), &mut MediaBuffer::new(vec![0; 16])))
                        .filter(Result::is_ok)
                        .count()
                })
            })
            .collect::<Vec<_>>();

        let binders = (0..2)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || bind(&gate))
            })
            .collect::<Vec<_>>();

        for binder in binders {
            binder.join().map_err(|_| "binder panicked")?;
        }

        let mut decrypted = 0;
        for producer in producers {
            decrypted += producer.join().map_err(|_| "producer panicked")?;
        }

        assert_eq!(gate.session_state(), SessionState::Bound);
        assert_eq!(decrypted, 40);
        assert_eq!(manager.decrypt_calls(), 40);
    }
    Ok(())
}
