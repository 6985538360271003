//! An empty flash means nothing to copy: no session directory, Empty
//! signal, clean exit.

mod common;

use bbsyncer::signal::{self, SignalEvent};
use bbsyncer::sync::{CancelFlag, Orchestrator, SyncOutcome};
use common::{client_for, test_config, FcSim, SimOptions};

#[tokio::test]
async fn empty_flash_short_circuits() {
    let root = tempfile::tempdir().unwrap();
    let sim = FcSim::new(SimOptions {
        flash: Vec::new(),
        ..SimOptions::default()
    });

    let cfg = test_config(root.path());
    let mut client = client_for(&sim, &cfg);
    let (handle, events) = signal::channel();
    let mut orchestrator = Orchestrator::new(cfg, handle, CancelFlag::new(), false);

    let outcome = orchestrator.run(&mut client).await.expect("clean outcome");
    assert_eq!(outcome, SyncOutcome::FlashEmpty);
    assert_eq!(*events.borrow(), Some(SignalEvent::Empty));

    // No session directory was created.
    let entries: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(entries.is_empty(), "storage root should stay empty");

    // No flash reads, no erase.
    let log = sim.request_log();
    assert!(!log.contains(&71));
    assert!(!log.contains(&72));
}
