use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use rstest::rstest;

use daemonctl::auth::{
    AllowProvider, AuthorizationGate, CredentialProvider, MutatingAction, TicketScope,
};
use daemonctl::clock::ManualClock;
use daemonctl::control::{LaunchdAdapter, Runner};
use daemonctl::error::InspectError;
use daemonctl::inspector::{ProcessInspector, scan_process_table};
use daemonctl::observer::StatusObserver;
use daemonctl::{
    AuthError, AutoStartFlag, ControlError, LifecycleController, ServiceAdapter,
    ServiceDescriptor, ServiceError, ServiceState, SignaturePattern, Timing,
};

const JAVA_LINE: &str = "/usr/bin/java -server -jar /opt/myapp/lib/startup.jar";

/// A fake process table rendered the way `ps -o pid=,command=` prints it.
#[derive(Default)]
struct Host {
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    hold: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl Host {
    fn table(&self) -> String {
        let mut table = String::from("    1 /sbin/launchd\n  312 /usr/sbin/syslogd\n");
        if self.running.load(Ordering::SeqCst) {
            table.push_str(&format!("  845 {JAVA_LINE}\n"));
        }
        table
    }

    fn hold(&self) {
        let hold = self.hold.lock().unwrap().clone();
        if let Some((entered, release)) = hold {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
    }
}

struct TableInspector(Arc<Host>);

impl ProcessInspector for TableInspector {
    fn probe(&self, d: &ServiceDescriptor) -> Result<bool, InspectError> {
        Ok(scan_process_table(&self.0.table(), d.signature(), &[]))
    }
}

struct HostAdapter(Arc<Host>);

impl ServiceAdapter for HostAdapter {
    fn start(&self, _: &ServiceDescriptor) -> Result<(), ServiceError> {
        self.0.starts.fetch_add(1, Ordering::SeqCst);
        self.0.hold();
        self.0.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, _: &ServiceDescriptor) -> Result<(), ServiceError> {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        self.0.hold();
        self.0.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_auto_start(&self, _: &ServiceDescriptor, _: bool) -> Result<(), ServiceError> {
        Ok(())
    }

    fn auto_start(&self, _: &ServiceDescriptor) -> AutoStartFlag {
        AutoStartFlag::Disabled
    }
}

/// Grants session tickets and counts how often it was asked.
#[derive(Default)]
struct CountingProvider {
    prompts: Arc<AtomicUsize>,
    deny: bool,
}

impl CredentialProvider for CountingProvider {
    fn request(&self, _: MutatingAction) -> Result<TicketScope, AuthError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            Err(AuthError::Denied)
        } else {
            Ok(TicketScope::Session)
        }
    }
}

#[derive(Default)]
struct History(Mutex<Vec<ServiceState>>);

impl StatusObserver for History {
    fn on_state_changed(&self, _: &ServiceState, new: &ServiceState) {
        self.0.lock().unwrap().push(new.clone());
    }
}

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "MyApp",
        SignaturePattern::literal("myapp/lib/startup.jar"),
        "com.example.myapp",
        "/Library/LaunchDaemons/com.example.myapp.plist",
    )
}

fn timing() -> Timing {
    Timing {
        command_timeout: Duration::from_secs(5),
        settle_timeout: Duration::from_secs(10),
        settle_poll: Duration::from_secs(1),
    }
}

fn controller(
    host: &Arc<Host>,
    provider: Box<dyn CredentialProvider>,
) -> (LifecycleController, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let gate = AuthorizationGate::new(provider, clock.clone(), Duration::from_secs(300));
    let ctl = LifecycleController::new(descriptor(), Arc::new(HostAdapter(host.clone())), gate)
        .inspector(Arc::new(TableInspector(host.clone())))
        .clock(clock.clone())
        .timing(timing());
    (ctl, clock)
}

#[test]
fn start_then_stop_a_java_daemon() {
    let host = Arc::new(Host::default());
    let (ctl, _) = controller(&host, Box::new(AllowProvider));
    let history = Arc::new(History::default());
    ctl.subscribe(history.clone());

    assert_eq!(ctl.poll_status(), ServiceState::Stopped);
    ctl.request_start().unwrap();
    assert_eq!(ctl.state(), ServiceState::Running);
    ctl.request_stop().unwrap();
    assert_eq!(ctl.state(), ServiceState::Stopped);

    assert_eq!(
        *history.0.lock().unwrap(),
        vec![
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Stopped,
        ]
    );
}

#[test]
fn daemon_started_elsewhere_is_picked_up_by_polling() {
    let host = Arc::new(Host::default());
    let (ctl, _) = controller(&host, Box::new(AllowProvider));
    assert_eq!(ctl.poll_status(), ServiceState::Stopped);

    host.running.store(true, Ordering::SeqCst);
    assert_eq!(ctl.poll_status(), ServiceState::Running);

    // already running: no adapter call
    ctl.request_start().unwrap();
    assert_eq!(host.starts.load(Ordering::SeqCst), 0);
}

#[test]
fn one_prompt_covers_a_session_until_revoked() {
    let host = Arc::new(Host::default());
    let prompts = Arc::new(AtomicUsize::new(0));
    let provider = CountingProvider {
        prompts: prompts.clone(),
        deny: false,
    };
    let (ctl, clock) = controller(&host, Box::new(provider));

    ctl.request_start().unwrap();
    ctl.request_stop().unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(301));
    ctl.request_start().unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 2);

    ctl.revoke_authorization();
    ctl.request_stop().unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 3);
}

#[test]
fn denied_request_leaves_the_daemon_alone() {
    let host = Arc::new(Host::default());
    let provider = CountingProvider {
        deny: true,
        ..Default::default()
    };
    let (ctl, _) = controller(&host, Box::new(provider));

    let err = ctl.request_start().unwrap_err();
    assert!(matches!(err, ControlError::Auth(AuthError::Denied)));
    assert_eq!(ctl.state(), ServiceState::Unknown);
    assert!(!ctl.is_busy());
    assert_eq!(host.starts.load(Ordering::SeqCst), 0);
}

#[rstest]
#[case::start_during_start(true)]
#[case::stop_during_start(false)]
fn overlapping_request_is_busy(#[case] second_is_start: bool) {
    let host = Arc::new(Host::default());
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    *host.hold.lock().unwrap() = Some((entered_tx, release_rx));

    let (ctl, _) = controller(&host, Box::new(AllowProvider));
    let ctl = Arc::new(ctl);

    let first = {
        let ctl = ctl.clone();
        thread::spawn(move || ctl.request_start())
    };
    entered_rx.recv().unwrap();

    let second = if second_is_start {
        ctl.request_start()
    } else {
        ctl.request_stop()
    };
    assert!(matches!(second, Err(ControlError::Busy)));

    release_tx.send(()).unwrap();
    first.join().unwrap().unwrap();
    assert_eq!(ctl.state(), ServiceState::Running);
    assert_eq!(host.starts.load(Ordering::SeqCst), 1);
    assert_eq!(host.stops.load(Ordering::SeqCst), 0);
}

#[test]
fn restart_cycles_a_running_daemon() {
    let host = Arc::new(Host::default());
    host.running.store(true, Ordering::SeqCst);
    let (ctl, _) = controller(&host, Box::new(AllowProvider));

    ctl.request_restart().unwrap();
    assert_eq!(ctl.state(), ServiceState::Running);
    assert_eq!(host.stops.load(Ordering::SeqCst), 1);
    assert_eq!(host.starts.load(Ordering::SeqCst), 1);
}

#[test]
fn launchd_auto_start_round_trips_through_the_plist() {
    let dir = tempfile::tempdir().unwrap();
    let plist_path = dir.path().join("com.example.myapp.plist");
    let mut job = plist::Dictionary::new();
    job.insert("Label".into(), "com.example.myapp".into());
    job.insert("RunAtLoad".into(), false.into());
    plist::Value::Dictionary(job)
        .to_file_xml(&plist_path)
        .unwrap();

    let d = ServiceDescriptor::new(
        "MyApp",
        SignaturePattern::literal("myapp/lib/startup.jar"),
        "com.example.myapp",
        &plist_path,
    );
    let host = Arc::new(Host::default());
    let clock = Arc::new(ManualClock::new());
    let gate = AuthorizationGate::new(Box::new(AllowProvider), clock.clone(), Duration::ZERO);
    let ctl = LifecycleController::new(d, Arc::new(LaunchdAdapter::new(Runner::new(false))), gate)
        .inspector(Arc::new(TableInspector(host.clone())))
        .clock(clock);

    assert_eq!(ctl.auto_start(), AutoStartFlag::Disabled);
    ctl.set_auto_start(true).unwrap();
    assert_eq!(ctl.auto_start(), AutoStartFlag::Enabled);

    let written = plist::Value::from_file(&plist_path).unwrap();
    let dict = written.as_dictionary().unwrap();
    assert_eq!(dict.get("RunAtLoad").and_then(|v| v.as_boolean()), Some(true));
    assert_eq!(
        dict.get("Label").and_then(|v| v.as_string()),
        Some("com.example.myapp")
    );
    // setting auto-start never touches the daemon
    assert_eq!(ctl.state(), ServiceState::Unknown);

    fs::remove_file(&plist_path).unwrap();
    assert!(!ctl.auto_start().is_known());
}
