//! Lifecycle tests driving a gateway manager against a recording hub
//! uplink and an in-memory channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use orbit_channel::{
    Channel, ChannelError, ChannelKind, ChannelResult, ErrorCallback, InboundFrame,
    MessageCallback, UnwrapFn, WrapFn,
};
use orbit_gateway::{GatewayConfig, GatewayError, GatewayHandle, GatewayManager, PrepContinuation};
use orbit_hub::{HubConfig, HubResult, HubUplink};
use orbit_proto::{Command, CommandId, CommandState};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ==================== Test Doubles ====================

#[derive(Default)]
struct RecordingUplink {
    frames: Mutex<Vec<Value>>,
}

impl HubUplink for RecordingUplink {
    fn transmit_raw(&self, frame: String) -> HubResult<()> {
        self.frames.lock().push(serde_json::from_str(&frame).unwrap());
        Ok(())
    }
}

impl RecordingUplink {
    fn frames(&self) -> Vec<Value> {
        self.frames.lock().clone()
    }

    /// `(id, state)` of every command update, in order.
    fn updates(&self) -> Vec<(CommandId, String)> {
        self.frames()
            .iter()
            .filter(|frame| frame["type"] == "command_update")
            .map(|frame| {
                (
                    frame["command"]["id"].as_u64().unwrap(),
                    frame["command"]["state"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    fn states_for(&self, id: CommandId) -> Vec<String> {
        self.updates()
            .into_iter()
            .filter(|(update_id, _)| *update_id == id)
            .map(|(_, state)| state)
            .collect()
    }

    fn update(&self, id: CommandId, state: &str) -> Option<Value> {
        self.frames().into_iter().find(|frame| {
            frame["type"] == "command_update"
                && frame["command"]["id"] == id
                && frame["command"]["state"] == state
        })
    }
}

/// A channel that records what it is asked to send.
#[derive(Default)]
struct MemoryChannel {
    systems: Mutex<BTreeMap<String, String>>,
    sent: Mutex<Vec<(String, Value)>>,
    closed: AtomicUsize,
}

impl MemoryChannel {
    fn sent_ids(&self) -> Vec<u64> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, data)| data["id"].as_u64())
            .collect()
    }
}

impl Channel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    fn register_system(
        &self,
        name: &str,
        destination: Option<&str>,
        _wrap: Option<WrapFn>,
        _unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        let mut systems = self.systems.lock();
        if systems.contains_key(name) {
            return Err(ChannelError::AlreadyRegistered(name.to_string()));
        }
        systems.insert(name.to_string(), destination.unwrap_or_default().to_string());
        Ok(())
    }

    fn unregister_system(&self, name: &str) {
        self.systems.lock().remove(name);
    }

    fn send(&self, data: &Value, system: Option<&str>) -> ChannelResult<()> {
        let system = system.unwrap_or_default().to_string();
        if !self.systems.lock().contains_key(&system) {
            return Err(ChannelError::NotRegistered(system));
        }
        self.sent.lock().push((system, data.clone()));
        Ok(())
    }

    fn set_wrap(&self, _wrap: WrapFn, _overwrite_custom: bool) {}

    fn set_unwrap(&self, _unwrap: UnwrapFn, _overwrite_custom: bool) {}

    fn set_system_transform(
        &self,
        name: &str,
        _wrap: Option<WrapFn>,
        _unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        if self.systems.lock().contains_key(name) {
            Ok(())
        } else {
            Err(ChannelError::NotRegistered(name.to_string()))
        }
    }

    fn on_message(&self, _callback: MessageCallback) -> ChannelResult<()> {
        Err(ChannelError::ReceiveSinkAttached)
    }

    fn detach_sink(&self) {}

    fn on_connection_error(&self, _callback: ErrorCallback) {}

    fn registered_systems(&self) -> Vec<String> {
        self.systems.lock().keys().cloned().collect()
    }

    fn address_details(&self) -> BTreeMap<String, String> {
        self.systems.lock().clone()
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ==================== Helper Functions ====================

struct Harness {
    uplink: Arc<RecordingUplink>,
    channel: Arc<MemoryChannel>,
    handle: GatewayHandle,
    task: JoinHandle<()>,
}

fn manager(parallel: bool) -> (GatewayManager, Arc<RecordingUplink>, Arc<MemoryChannel>) {
    let uplink = Arc::new(RecordingUplink::default());
    let config = GatewayConfig::new(HubConfig::new("hub.example.com", "token")).with_parallel(parallel);
    let mut manager = GatewayManager::with_uplink(config, uplink.clone()).unwrap();

    let channel = Arc::new(MemoryChannel::default());
    manager.bus().insert(channel.clone());
    manager.add_system("sat", ChannelKind::Udp, Some("9000")).unwrap();
    (manager, uplink, channel)
}

fn start(manager: GatewayManager, uplink: Arc<RecordingUplink>, channel: Arc<MemoryChannel>) -> Harness {
    let (handle, task) = manager.start();
    Harness {
        uplink,
        channel,
        handle,
        task,
    }
}

fn serial() -> Harness {
    let (manager, uplink, channel) = manager(false);
    start(manager, uplink, channel)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn system_update(id: CommandId, state: &str) -> InboundFrame {
    InboundFrame {
        channel: ChannelKind::Udp,
        system: "sat".to_string(),
        message: json!({"type": "command_update", "command": {"id": id, "state": state}}),
    }
}

fn ping(id: CommandId) -> Command {
    Command::new(id, "ping", "sat")
}

// ==================== Hub Commands ====================

#[tokio::test]
async fn test_valid_command_reports_preparing_once() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();

    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    assert_eq!(
        h.uplink.states_for(1),
        vec!["preparing_on_gateway".to_string(), "uplinking_to_system".to_string()]
    );
    let (system, data) = h.channel.sent.lock()[0].clone();
    assert_eq!(system, "sat");
    assert_eq!(data["type"], "ping");
    h.task.abort();
}

#[tokio::test]
async fn test_failed_validation() {
    let (mut manager, uplink, channel) = manager(false);
    manager.validate_command(Arc::new(|command: &Command| {
        if command.fields[0]["value"].as_i64().unwrap_or_default() > 1 {
            Err("bad".into())
        } else {
            Ok(())
        }
    }));
    let h = start(manager, uplink, channel);

    h.handle
        .submit_command(ping(1).with_fields(json!([{"value": 2}])))
        .unwrap();

    wait_until(|| h.uplink.update(1, "failed").is_some()).await;
    let failed = h.uplink.update(1, "failed").unwrap();
    assert_eq!(failed["command"]["errors"], json!(["bad"]));
    assert_eq!(h.uplink.states_for(1), vec!["failed".to_string()]);
    assert!(h.channel.sent_ids().is_empty());
    h.task.abort();
}

#[tokio::test]
async fn test_type_validator_overrides_general() {
    let (mut manager, uplink, channel) = manager(false);
    manager.validate_command(Arc::new(|_: &Command| Err("general".into())));
    manager.validate_command_type("ping", Arc::new(|_: &Command| Ok(())));
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    h.handle.submit_command(Command::new(2, "other", "sat")).unwrap();

    wait_until(|| h.uplink.update(2, "failed").is_some()).await;
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.task.abort();
}

#[tokio::test]
async fn test_unknown_destination_fails() {
    let h = serial();
    h.handle.submit_command(Command::new(1, "ping", "ghost")).unwrap();

    wait_until(|| h.uplink.update(1, "failed").is_some()).await;
    let failed = h.uplink.update(1, "failed").unwrap();
    assert_eq!(
        failed["command"]["errors"],
        json!(["Could not find destination system ghost"])
    );
    h.task.abort();
}

// ==================== Queueing ====================

#[tokio::test]
async fn test_serial_queue_order() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    h.handle.submit_command(ping(2)).unwrap();

    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.channel.sent_ids(), vec![1]);
    assert!(h.uplink.update(2, "uplinking_to_system").is_none());

    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1, 2]).await;
    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    assert_eq!(
        h.uplink.states_for(1),
        vec![
            "preparing_on_gateway".to_string(),
            "uplinking_to_system".to_string(),
            "processing_on_gateway".to_string(),
            "completed".to_string(),
        ]
    );
    h.task.abort();
}

#[tokio::test]
async fn test_parallel_dispatches_immediately() {
    let (manager, uplink, channel) = manager(true);
    let h = start(manager, uplink, channel);
    h.handle.submit_command(ping(1)).unwrap();
    h.handle.submit_command(ping(2)).unwrap();

    wait_until(|| h.channel.sent_ids().len() == 2).await;
    h.task.abort();
}

#[tokio::test]
async fn test_pass_through_states_are_reported() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;

    for state in ["acked_by_system", "executing_on_system", "downlinking_from_system"] {
        h.handle.write_inbound(system_update(1, state)).unwrap();
    }
    wait_until(|| h.uplink.update(1, "downlinking_from_system").is_some()).await;
    let states = h.uplink.states_for(1);
    assert_eq!(&states[2..], ["acked_by_system", "executing_on_system", "downlinking_from_system"]);
    h.task.abort();
}

// ==================== Failures and Cancellation ====================

#[tokio::test]
async fn test_unknown_state_fails() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;

    h.handle.write_inbound(system_update(1, "teleporting")).unwrap();
    wait_until(|| h.uplink.update(1, "failed").is_some()).await;
    let failed = h.uplink.update(1, "failed").unwrap();
    assert_eq!(
        failed["command"]["errors"],
        json!(["Gateway did not understand state teleporting"])
    );
    h.task.abort();
}

#[tokio::test]
async fn test_failure_frees_slot_for_next_command() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    h.handle.submit_command(ping(2)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;

    h.handle.fail(ping(1), vec!["radio fault".to_string()]).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1, 2]).await;
    let failed = h.uplink.update(1, "failed").unwrap();
    assert_eq!(failed["command"]["errors"], json!(["radio fault"]));
    h.task.abort();
}

#[tokio::test]
async fn test_cancel_waiting_command() {
    let (mut manager, uplink, channel) = manager(false);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let seen = cancelled.clone();
    manager.on_cancelled(Arc::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    h.handle.submit_command(ping(2)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;

    h.handle.cancel(2).unwrap();
    wait_until(|| h.uplink.update(2, "cancelled").is_some()).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();
    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    assert_eq!(h.channel.sent_ids(), vec![1]);
    h.task.abort();
}

#[tokio::test]
async fn test_cancel_unknown_command_is_ignored() {
    let h = serial();
    h.handle.cancel(99).unwrap();
    h.handle.submit_command(ping(1)).unwrap();

    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    assert!(h.uplink.states_for(99).is_empty());
    h.task.abort();
}

#[tokio::test]
async fn test_cancel_before_preparing_is_final() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    h.handle.cancel(1).unwrap();
    h.handle.submit_command(ping(2)).unwrap();

    // Command 2 is prepared after the deferred step of command 1.
    wait_until(|| h.channel.sent_ids() == vec![2]).await;
    assert_eq!(
        h.uplink.states_for(1),
        vec!["preparing_on_gateway".to_string(), "cancelled".to_string()]
    );
    h.task.abort();
}

#[tokio::test]
async fn test_cancel_with_hook_before_preparing_is_final() {
    let (mut manager, uplink, channel) = manager(false);
    manager.on_cancelled(Arc::new(|_| {}));
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    h.handle.cancel(1).unwrap();
    h.handle.submit_command(ping(2)).unwrap();

    wait_until(|| h.channel.sent_ids() == vec![2]).await;
    assert_eq!(
        h.uplink.states_for(1),
        vec!["preparing_on_gateway".to_string(), "cancelled".to_string()]
    );
    h.task.abort();
}

#[tokio::test]
async fn test_continuation_after_cancel_is_dropped() {
    let (mut manager, uplink, channel) = manager(false);
    let held: Arc<Mutex<Option<PrepContinuation>>> = Arc::new(Mutex::new(None));
    let stash = held.clone();
    manager.handle_on_gateway(
        "ping",
        Arc::new(move |_, next| {
            *stash.lock() = Some(next);
        }),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| held.lock().is_some()).await;
    h.handle.cancel(1).unwrap();
    wait_until(|| h.uplink.update(1, "cancelled").is_some()).await;

    let next = held.lock().take().unwrap();
    next.done();
    h.handle.submit_command(Command::new(2, "status", "sat")).unwrap();

    wait_until(|| h.channel.sent_ids() == vec![2]).await;
    assert_eq!(
        h.uplink.states_for(1),
        vec!["preparing_on_gateway".to_string(), "cancelled".to_string()]
    );
    h.task.abort();
}

#[tokio::test]
async fn test_updates_for_inactive_commands_are_dropped() {
    let h = serial();
    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();
    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    let reported = h.uplink.states_for(1);

    h.handle.write_inbound(system_update(42, "teleporting")).unwrap();
    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();
    h.handle.write_inbound(system_update(1, "warp")).unwrap();
    h.handle
        .write_inbound(InboundFrame {
            channel: ChannelKind::Udp,
            system: "sat".to_string(),
            message: json!({"type": "event", "event": {"message": "after", "system": "sat"}}),
        })
        .unwrap();

    // Inbound frames are handled in order, so the event marks the end.
    wait_until(|| h.uplink.frames().iter().any(|frame| frame["type"] == "event")).await;
    assert!(h.uplink.states_for(42).is_empty());
    assert_eq!(h.uplink.states_for(1), reported);
    h.task.abort();
}

// ==================== Handlers and Processors ====================

#[tokio::test]
async fn test_prep_handler_completes_on_gateway() {
    let (mut manager, uplink, channel) = manager(false);
    manager.handle_on_gateway(
        "ping",
        Arc::new(|_, next| next.complete(Some(json!("pong")))),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    let completed = h.uplink.update(1, "completed").unwrap();
    assert_eq!(completed["command"]["output"], "pong");
    assert!(h.channel.sent_ids().is_empty());
    h.task.abort();
}

#[tokio::test]
async fn test_processor_registered_for_one_command() {
    let (mut manager, uplink, channel) = manager(false);
    manager.handle_on_gateway(
        "ping",
        Arc::new(|_, next| {
            next.done_with_processor(Arc::new(|_, next| next.done_with_output(json!(42))));
        }),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();

    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    assert_eq!(h.uplink.update(1, "completed").unwrap()["command"]["output"], 42);
    h.task.abort();
}

#[tokio::test]
async fn test_type_processor_can_fail() {
    let (mut manager, uplink, channel) = manager(false);
    manager.process_on_gateway(
        "ping",
        Arc::new(|_, next| next.fail(vec!["checksum mismatch".to_string()])),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle.write_inbound(system_update(1, "done_on_system")).unwrap();

    wait_until(|| h.uplink.update(1, "failed").is_some()).await;
    assert!(h.uplink.update(1, "completed").is_none());
    h.task.abort();
}

#[tokio::test]
async fn test_downlink_handler_runs() {
    let (mut manager, uplink, channel) = manager(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    manager.handle_downlink(
        "ping",
        Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle
        .write_inbound(system_update(1, "downlinking_from_system"))
        .unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    h.task.abort();
}

// ==================== Listeners ====================

#[tokio::test]
async fn test_listener_replaces_default_until_removed() {
    let h = serial();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    h.handle
        .attach_listener(
            CommandState::AckedBySystem,
            Arc::new(move |_, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                true
            }),
        )
        .unwrap();

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle.write_inbound(system_update(1, "acked_by_system")).unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    assert!(h.uplink.update(1, "acked_by_system").is_none());

    h.handle.remove_listener(CommandState::AckedBySystem).unwrap();
    h.handle.write_inbound(system_update(1, "acked_by_system")).unwrap();
    wait_until(|| h.uplink.update(1, "acked_by_system").is_some()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    h.task.abort();
}

#[tokio::test]
async fn test_listener_returning_false_keeps_default() {
    let (mut manager, uplink, channel) = manager(false);
    manager.attach_listener(CommandState::ExecutingOnSystem, Arc::new(|_, _, _| false));
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle
        .write_inbound(system_update(1, "executing_on_system"))
        .unwrap();
    wait_until(|| h.uplink.update(1, "executing_on_system").is_some()).await;
    h.task.abort();
}

#[tokio::test]
async fn test_listener_can_drive_transitions() {
    let (mut manager, uplink, channel) = manager(false);
    manager.attach_listener(
        CommandState::AckedBySystem,
        Arc::new(|command, _, handle| {
            handle
                .transition(CommandState::DoneOnSystem, command.clone())
                .is_ok()
        }),
    );
    let h = start(manager, uplink, channel);

    h.handle.submit_command(ping(1)).unwrap();
    wait_until(|| h.channel.sent_ids() == vec![1]).await;
    h.handle.write_inbound(system_update(1, "acked_by_system")).unwrap();
    wait_until(|| h.uplink.update(1, "completed").is_some()).await;
    h.task.abort();
}

#[test]
fn test_listener_by_name_rejects_unknown_state() {
    let (mut manager, _uplink, _channel) = manager(false);
    let result = manager.attach_listener_by_name("teleporting", Arc::new(|_, _, _| true));
    assert!(matches!(result, Err(GatewayError::UnknownState(state)) if state == "teleporting"));
    assert!(
        manager
            .attach_listener_by_name("completed", Arc::new(|_, _, _| true))
            .is_ok()
    );
}

// ==================== System Messages ====================

#[tokio::test]
async fn test_measurements_forwarded_with_timestamp() {
    let h = serial();
    h.handle
        .write_inbound(InboundFrame {
            channel: ChannelKind::Udp,
            system: "A".to_string(),
            message: json!({
                "type": "measurements",
                "measurements": [{"system": "A", "subsystem": "b", "metric": "c", "value": 5}],
            }),
        })
        .unwrap();

    wait_until(|| !h.uplink.frames().is_empty()).await;
    let frame = h.uplink.frames()[0].clone();
    assert_eq!(frame["type"], "measurements");
    assert_eq!(frame["measurements"][0]["value"], 5);
    assert!(frame["measurements"][0]["timestamp"].is_i64());
    h.task.abort();
}

#[tokio::test]
async fn test_system_messages_are_forwarded() {
    let h = serial();
    let messages = [
        json!({"type": "event", "event": {"message": "hi", "system": "sat"}}),
        json!({"type": "command_definitions_update",
               "command_definitions": {"system": "sat", "definitions": {"ping": {}}}}),
        json!({"type": "file_list", "file_list": {"system": "sat", "files": [], "timestamp": 7}}),
        json!({"type": "file_metadata_update", "downlinked_file": {"name": "a.bin"}}),
        json!({"type": "unknown_kind"}),
    ];
    for message in messages {
        h.handle
            .write_inbound(InboundFrame {
                channel: ChannelKind::Udp,
                system: "sat".to_string(),
                message,
            })
            .unwrap();
    }

    wait_until(|| h.uplink.frames().len() == 4).await;
    let kinds: Vec<_> = h
        .uplink
        .frames()
        .iter()
        .map(|frame| frame["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        kinds,
        vec!["event", "command_definitions_update", "file_list", "file_metadata_update"]
    );
    assert_eq!(h.uplink.frames()[2]["file_list"]["timestamp"], 7);
    h.task.abort();
}

#[tokio::test]
async fn test_inbound_mirror_sees_every_frame() {
    let h = serial();
    let mut mirror = h.handle.subscribe_inbound();
    let frame = system_update(5, "acked_by_system");
    h.handle.write_inbound(frame.clone()).unwrap();

    let copy = timeout(TEST_TIMEOUT, mirror.recv()).await.unwrap().unwrap();
    assert_eq!(copy, frame);
    h.task.abort();
}

// ==================== Configuration ====================

#[test]
fn test_add_system_requires_open_channel() {
    let uplink = Arc::new(RecordingUplink::default());
    let config = GatewayConfig::new(HubConfig::new("hub.example.com", "token"));
    let mut manager = GatewayManager::with_uplink(config, uplink).unwrap();

    assert!(matches!(
        manager.add_system("sat", ChannelKind::WebSocket, None),
        Err(GatewayError::ChannelNotOpen(ChannelKind::WebSocket))
    ));
}

#[test]
fn test_translate_targets() {
    let (manager, _uplink, _channel) = manager(false);
    let wrap: WrapFn = Arc::new(|_, _| Ok(Vec::new()));

    assert!(manager.translate_outbound_for(&["udp", "sat"], wrap.clone(), false).is_ok());
    assert!(matches!(
        manager.translate_outbound_for(&["sat", "ghost"], wrap.clone(), false),
        Err(GatewayError::UnknownTarget(target)) if target == "ghost"
    ));
    assert!(matches!(
        manager.translate_outbound_for(&[], wrap, false),
        Err(GatewayError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_shutdown_closes_channels() {
    let h = serial();
    h.handle.shutdown().unwrap();

    timeout(TEST_TIMEOUT, h.task).await.unwrap().unwrap();
    assert!(h.handle.is_stopped());
    assert_eq!(h.channel.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(h.handle.submit_command(ping(1)), Err(GatewayError::Stopped)));
}
