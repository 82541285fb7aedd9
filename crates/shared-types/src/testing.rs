//! Simulated platform for deterministic tests.
//!
//! Models just enough of the Windows object manager for the service: per
//! process handle tables, events, process objects that signal on exit,
//! creation times that change when a PID is reused, user tokens and
//! process creation. Enable with the `test-utils` feature flag.
//!
//! Every [`SimulatedPlatform`] value is a *view* of one shared machine from
//! the point of view of one process. [`SimulatedPlatform::new`] returns the
//! service's view; [`SimulatedPlatform::process_view`] returns the view of
//! another process, which is how a test plays the part of a child answering
//! the authentication challenge.
//!
//! # Example
//!
//! ```rust
//! use shared_types::testing::SimulatedPlatform;
//! use shared_types::Platform;
//!
//! let sim = SimulatedPlatform::new();
//! let child = sim.spawn_process();
//! let first = sim.process_creation_time(child).unwrap();
//! sim.reuse_pid(child);
//! assert_ne!(sim.process_creation_time(child).unwrap(), first);
//! ```

use crate::entities::{
    CreationToken, LaunchRequest, LaunchedProcess, Pid, ProcessAccess, RawHandle, WaitOutcome,
};
use crate::errors::{
    PlatformError, PlatformResult, ERROR_ACCESS_DENIED, ERROR_INVALID_HANDLE,
    ERROR_INVALID_PARAMETER, ERROR_NO_TOKEN, ERROR_PIPE_BUSY,
};
use crate::platform::Platform;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// PID of the process owning the default view.
pub const SERVICE_PID: Pid = Pid(500);

/// Return value of a failed wait.
const WAIT_FAILED: i64 = 0xFFFF_FFFF;

type ObjectId = u64;

/// Callback run after a simulated process has been created.
pub type LaunchHook = Arc<dyn Fn(LaunchRecord) + Send + Sync>;

/// Callback playing the client side of [`Platform::grant_pipe_access`].
/// Returns false if the pipe could not be opened.
pub type PipeConnector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A process created through [`Platform::create_process_as_user`].
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    /// PID of the new process.
    pub pid: Pid,
    /// Name of the user owning the token, `None` when run as the current user.
    pub user: Option<String>,
    /// Whether the token was elevated.
    pub elevated: bool,
    /// The request as received.
    pub request: LaunchRequest,
}

impl LaunchRecord {
    /// Value of an environment variable in the launch environment.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.request.environment.iter().find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }
}

#[derive(Debug)]
enum Object {
    Event { signaled: bool, manual_reset: bool },
    Process { exited: bool },
    Thread,
    Token { user: String, elevated: bool },
}

#[derive(Debug)]
struct ObjectEntry {
    object: Object,
    refs: usize,
}

#[derive(Debug)]
struct ProcessEntry {
    object: ObjectId,
    creation: CreationToken,
    alive: bool,
}

struct State {
    next_handle: u64,
    next_object: ObjectId,
    next_pid: u32,
    next_creation: u64,
    objects: HashMap<ObjectId, ObjectEntry>,
    tables: HashMap<Pid, HashMap<RawHandle, ObjectId>>,
    processes: HashMap<Pid, ProcessEntry>,
    launches: Vec<LaunchRecord>,
    granted_pipes: Vec<String>,
    terminated: Vec<Pid>,
    desktop_user: Option<String>,
    service: bool,
    elevation_available: bool,
    fail_launch: bool,
    wait_failures: usize,
    launch_hook: Option<LaunchHook>,
    pipe_connector: Option<PipeConnector>,
}

impl State {
    fn new_object(&mut self, object: Object, refs: usize) -> ObjectId {
        self.next_object += 1;
        let id = self.next_object;
        self.objects.insert(id, ObjectEntry { object, refs });
        id
    }

    fn insert_handle(&mut self, owner: Pid, object: ObjectId) -> RawHandle {
        self.next_handle += 4;
        let handle = RawHandle(self.next_handle);
        self.tables.entry(owner).or_default().insert(handle, object);
        if let Some(entry) = self.objects.get_mut(&object) {
            entry.refs += 1;
        }
        handle
    }

    fn lookup(&self, owner: Pid, handle: RawHandle) -> Option<ObjectId> {
        self.tables.get(&owner)?.get(&handle).copied()
    }

    fn release(&mut self, object: ObjectId) {
        let remove = match self.objects.get_mut(&object) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if remove {
            self.objects.remove(&object);
        }
    }

    fn new_process(&mut self, pid: Pid) -> (CreationToken, ObjectId) {
        self.next_creation += 1;
        let creation = CreationToken(self.next_creation);
        // The running process keeps its own object alive.
        let object = self.new_object(Object::Process { exited: false }, 1);
        self.processes.insert(
            pid,
            ProcessEntry {
                object,
                creation,
                alive: true,
            },
        );
        (creation, object)
    }

    fn allocate_pid(&mut self) -> Pid {
        self.next_pid += 4;
        Pid(self.next_pid)
    }

    fn exit(&mut self, pid: Pid) -> bool {
        let Some(process) = self.processes.get_mut(&pid) else {
            return false;
        };
        if !process.alive {
            return false;
        }
        process.alive = false;
        let object = process.object;
        if let Some(ObjectEntry {
            object: Object::Process { exited },
            ..
        }) = self.objects.get_mut(&object)
        {
            *exited = true;
        }
        // An exited process closes every handle it held.
        if let Some(table) = self.tables.remove(&pid) {
            for held in table.into_values() {
                self.release(held);
            }
        }
        self.release(object);
        true
    }

    fn new_token(&mut self, owner: Pid, user: String, elevated: bool) -> RawHandle {
        let object = self.new_object(Object::Token { user, elevated }, 0);
        self.insert_handle(owner, object)
    }
}

struct Machine {
    state: Mutex<State>,
    changed: Condvar,
}

/// A view of the simulated machine from one process.
#[derive(Clone)]
pub struct SimulatedPlatform {
    machine: Arc<Machine>,
    view: Pid,
}

impl std::fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("view", &self.view)
            .finish()
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    /// A fresh machine, viewed from the service process. A desktop user
    /// named `"user"` is logged on.
    pub fn new() -> Self {
        let mut state = State {
            next_handle: 0x100,
            next_object: 0,
            next_pid: 1000,
            next_creation: 0,
            objects: HashMap::new(),
            tables: HashMap::new(),
            processes: HashMap::new(),
            launches: Vec::new(),
            granted_pipes: Vec::new(),
            terminated: Vec::new(),
            desktop_user: Some("user".to_string()),
            service: true,
            elevation_available: true,
            fail_launch: false,
            wait_failures: 0,
            launch_hook: None,
            pipe_connector: None,
        };
        state.new_process(SERVICE_PID);

        Self {
            machine: Arc::new(Machine {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
            view: SERVICE_PID,
        }
    }

    /// The same machine seen from another process.
    #[must_use]
    pub fn process_view(&self, pid: Pid) -> Self {
        Self {
            machine: self.machine.clone(),
            view: pid,
        }
    }

    /// PID of the process this view belongs to.
    pub fn current_pid(&self) -> Pid {
        self.view
    }

    /// Start a process directly, without going through a launch.
    pub fn spawn_process(&self) -> Pid {
        let mut state = self.machine.state.lock();
        let pid = state.allocate_pid();
        state.new_process(pid);
        pid
    }

    /// Make a process exit. Returns false if it was not running.
    pub fn exit_process(&self, pid: Pid) -> bool {
        let exited = self.machine.state.lock().exit(pid);
        self.machine.changed.notify_all();
        exited
    }

    /// End the process with `pid`, if any, and start an unrelated process
    /// with the same PID.
    pub fn reuse_pid(&self, pid: Pid) -> CreationToken {
        let token = {
            let mut state = self.machine.state.lock();
            state.exit(pid);
            state.new_process(pid).0
        };
        self.machine.changed.notify_all();
        token
    }

    /// Make the next `count` waits fail as if given an invalid handle.
    pub fn fail_next_waits(&self, count: usize) {
        self.machine.state.lock().wait_failures += count;
        self.machine.changed.notify_all();
    }

    /// Set or clear the logged-on desktop user.
    pub fn set_desktop_user(&self, user: Option<&str>) {
        self.machine.state.lock().desktop_user = user.map(str::to_string);
    }

    /// Choose whether the machine reports running as a service.
    pub fn set_service(&self, service: bool) {
        self.machine.state.lock().service = service;
    }

    /// Choose whether elevated tokens can be obtained.
    pub fn set_elevation_available(&self, available: bool) {
        self.machine.state.lock().elevation_available = available;
    }

    /// Make process creation fail.
    pub fn set_fail_launch(&self, fail: bool) {
        self.machine.state.lock().fail_launch = fail;
    }

    /// Run `hook` after every successful process creation.
    pub fn on_launch(&self, hook: impl Fn(LaunchRecord) + Send + Sync + 'static) {
        self.machine.state.lock().launch_hook = Some(Arc::new(hook));
    }

    /// Client connection made by [`Platform::grant_pipe_access`].
    pub fn set_pipe_connector(&self, connector: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.machine.state.lock().pipe_connector = Some(Arc::new(connector));
    }

    /// Every process created so far.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.machine.state.lock().launches.clone()
    }

    /// Pipes whose DACL was modified.
    pub fn granted_pipes(&self) -> Vec<String> {
        self.machine.state.lock().granted_pipes.clone()
    }

    /// Processes ended through [`Platform::terminate_process`].
    pub fn terminated(&self) -> Vec<Pid> {
        self.machine.state.lock().terminated.clone()
    }

    /// Number of handles currently open in the handle table of `pid`.
    pub fn open_handle_count(&self, pid: Pid) -> usize {
        self.machine
            .state
            .lock()
            .tables
            .get(&pid)
            .map_or(0, HashMap::len)
    }

    fn fail(call: &str, return_code: i64, os_error: u32) -> PlatformError {
        PlatformError::new(call, return_code, os_error)
    }
}

impl Platform for SimulatedPlatform {
    fn open_process(&self, pid: Pid, _access: ProcessAccess) -> PlatformResult<RawHandle> {
        let mut state = self.machine.state.lock();
        let object = match state.processes.get(&pid) {
            Some(process) if process.alive => process.object,
            _ => return Err(Self::fail("OpenProcess", 0, ERROR_INVALID_PARAMETER)),
        };
        Ok(state.insert_handle(self.view, object))
    }

    fn close_handle(&self, handle: RawHandle) -> PlatformResult<()> {
        let mut state = self.machine.state.lock();
        let object = state
            .tables
            .get_mut(&self.view)
            .and_then(|table| table.remove(&handle))
            .ok_or_else(|| Self::fail("CloseHandle", 0, ERROR_INVALID_HANDLE))?;
        state.release(object);
        Ok(())
    }

    fn duplicate_handle_into(
        &self,
        source: RawHandle,
        target_process: RawHandle,
    ) -> PlatformResult<RawHandle> {
        let mut state = self.machine.state.lock();
        let object = state
            .lookup(self.view, source)
            .ok_or_else(|| Self::fail("DuplicateHandle", 0, ERROR_INVALID_HANDLE))?;
        let target_object = state
            .lookup(self.view, target_process)
            .ok_or_else(|| Self::fail("DuplicateHandle", 0, ERROR_INVALID_HANDLE))?;
        let target = state
            .processes
            .iter()
            .find(|(_, p)| p.object == target_object && p.alive)
            .map(|(pid, _)| *pid)
            .ok_or_else(|| Self::fail("DuplicateHandle", 0, ERROR_ACCESS_DENIED))?;
        Ok(state.insert_handle(target, object))
    }

    fn create_event(&self, manual_reset: bool) -> PlatformResult<RawHandle> {
        let mut state = self.machine.state.lock();
        let object = state.new_object(
            Object::Event {
                signaled: false,
                manual_reset,
            },
            0,
        );
        Ok(state.insert_handle(self.view, object))
    }

    fn set_event(&self, event: RawHandle) -> PlatformResult<()> {
        {
            let mut state = self.machine.state.lock();
            let object = state
                .lookup(self.view, event)
                .ok_or_else(|| Self::fail("SetEvent", 0, ERROR_INVALID_HANDLE))?;
            match state.objects.get_mut(&object) {
                Some(ObjectEntry {
                    object: Object::Event { signaled, .. },
                    ..
                }) => *signaled = true,
                _ => return Err(Self::fail("SetEvent", 0, ERROR_INVALID_HANDLE)),
            }
        }
        self.machine.changed.notify_all();
        Ok(())
    }

    fn wait_for_any(
        &self,
        handles: &[RawHandle],
        timeout: Option<Duration>,
    ) -> PlatformResult<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.machine.state.lock();
        loop {
            if state.wait_failures > 0 {
                state.wait_failures -= 1;
                return Err(Self::fail(
                    "WaitForMultipleObjects",
                    WAIT_FAILED,
                    ERROR_INVALID_HANDLE,
                ));
            }

            for (index, handle) in handles.iter().enumerate() {
                let object = state.lookup(self.view, *handle).ok_or_else(|| {
                    Self::fail("WaitForMultipleObjects", WAIT_FAILED, ERROR_INVALID_HANDLE)
                })?;
                match state.objects.get_mut(&object).map(|e| &mut e.object) {
                    Some(Object::Event {
                        signaled,
                        manual_reset,
                    }) if *signaled => {
                        if !*manual_reset {
                            *signaled = false;
                        }
                        return Ok(WaitOutcome::Signaled(index));
                    }
                    Some(Object::Process { exited: true }) => {
                        return Ok(WaitOutcome::Signaled(index));
                    }
                    _ => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    self.machine.changed.wait_until(&mut state, deadline);
                }
                None => self.machine.changed.wait(&mut state),
            }
        }
    }

    fn process_creation_time(&self, pid: Pid) -> PlatformResult<Option<CreationToken>> {
        let state = self.machine.state.lock();
        Ok(state.processes.get(&pid).and_then(|process| {
            // An exited process can still be queried while a handle keeps its
            // object alive.
            (process.alive || state.objects.contains_key(&process.object))
                .then_some(process.creation)
        }))
    }

    fn process_exists(&self, pid: Pid) -> bool {
        self.machine
            .state
            .lock()
            .processes
            .get(&pid)
            .is_some_and(|process| process.alive)
    }

    fn terminate_process(&self, pid: Pid) -> PlatformResult<()> {
        let ended = {
            let mut state = self.machine.state.lock();
            let ended = state.exit(pid);
            if ended {
                state.terminated.push(pid);
            }
            ended
        };
        self.machine.changed.notify_all();
        if ended {
            Ok(())
        } else {
            Err(Self::fail("TerminateProcess", 0, ERROR_ACCESS_DENIED))
        }
    }

    fn is_service(&self) -> bool {
        self.machine.state.lock().service
    }

    fn desktop_user_token(&self) -> PlatformResult<Option<RawHandle>> {
        let mut state = self.machine.state.lock();
        if !state.service {
            return Ok(Some(state.new_token(self.view, "current".into(), false)));
        }
        match state.desktop_user.clone() {
            Some(user) => Ok(Some(state.new_token(self.view, user, false))),
            None => Ok(None),
        }
    }

    fn elevated_token(&self, token: RawHandle) -> PlatformResult<RawHandle> {
        let mut state = self.machine.state.lock();
        let object = state
            .lookup(self.view, token)
            .ok_or_else(|| Self::fail("GetTokenInformation", 0, ERROR_INVALID_HANDLE))?;
        let user = match state.objects.get(&object).map(|e| &e.object) {
            Some(Object::Token { user, .. }) => user.clone(),
            _ => return Err(Self::fail("GetTokenInformation", 0, ERROR_INVALID_HANDLE)),
        };
        if !state.elevation_available {
            return Err(Self::fail("GetTokenInformation", 0, ERROR_NO_TOKEN));
        }
        Ok(state.new_token(self.view, user, true))
    }

    fn user_environment(&self, token: Option<RawHandle>) -> PlatformResult<Vec<String>> {
        let state = self.machine.state.lock();
        let user = match token {
            Some(token) => {
                let object = state.lookup(self.view, token).ok_or_else(|| {
                    Self::fail("CreateEnvironmentBlock", 0, ERROR_INVALID_HANDLE)
                })?;
                match state.objects.get(&object).map(|e| &e.object) {
                    Some(Object::Token { user, .. }) => user.clone(),
                    _ => {
                        return Err(Self::fail(
                            "CreateEnvironmentBlock",
                            0,
                            ERROR_INVALID_HANDLE,
                        ))
                    }
                }
            }
            None => "SYSTEM".to_string(),
        };
        Ok(vec![
            format!("USERNAME={user}"),
            format!("APPDATA=C:\\Users\\{user}\\AppData\\Roaming"),
            "Path=C:\\Windows\\system32;C:\\Windows".to_string(),
        ])
    }

    fn create_process_as_user(
        &self,
        token: Option<RawHandle>,
        request: &LaunchRequest,
    ) -> PlatformResult<LaunchedProcess> {
        let (launched, record, hook) = {
            let mut state = self.machine.state.lock();
            if state.fail_launch {
                return Err(Self::fail("CreateProcessAsUser", 0, ERROR_ACCESS_DENIED));
            }
            let (user, elevated) = match token {
                Some(token) => {
                    let object = state.lookup(self.view, token).ok_or_else(|| {
                        Self::fail("CreateProcessAsUser", 0, ERROR_INVALID_HANDLE)
                    })?;
                    match state.objects.get(&object).map(|e| &e.object) {
                        Some(Object::Token { user, elevated }) => (Some(user.clone()), *elevated),
                        _ => {
                            return Err(Self::fail(
                                "CreateProcessAsUser",
                                0,
                                ERROR_INVALID_HANDLE,
                            ))
                        }
                    }
                }
                None => (None, false),
            };

            let pid = state.allocate_pid();
            let (_, process_object) = state.new_process(pid);
            let process_handle = state.insert_handle(self.view, process_object);
            let thread_object = state.new_object(Object::Thread, 0);
            let thread_handle = state.insert_handle(self.view, thread_object);

            let record = LaunchRecord {
                pid,
                user,
                elevated,
                request: request.clone(),
            };
            state.launches.push(record.clone());
            (
                LaunchedProcess {
                    pid,
                    process_handle,
                    thread_handle,
                },
                record,
                state.launch_hook.clone(),
            )
        };

        if let Some(hook) = hook {
            hook(record);
        }
        Ok(launched)
    }

    fn grant_pipe_access(&self, pipe_name: &str) -> PlatformResult<()> {
        let connector = {
            let mut state = self.machine.state.lock();
            state.granted_pipes.push(pipe_name.to_string());
            state.pipe_connector.clone()
        };
        match connector {
            Some(connect) if !connect(pipe_name) => {
                Err(Self::fail("CreateFile", -1, ERROR_PIPE_BUSY))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicated_event_is_usable_only_by_target() {
        let sim = SimulatedPlatform::new();
        let child = sim.spawn_process();
        let impostor = sim.spawn_process();

        let process = sim.open_process(child, ProcessAccess::DuplicateHandle).unwrap();
        let event = sim.create_event(false).unwrap();
        let remote = sim.duplicate_handle_into(event, process).unwrap();

        assert!(sim.process_view(impostor).set_event(remote).is_err());
        sim.process_view(child).set_event(remote).unwrap();

        let outcome = sim
            .wait_for_any(&[event], Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Signaled(0));
    }

    #[test]
    fn test_auto_reset_event_resets_after_wait() {
        let sim = SimulatedPlatform::new();
        let event = sim.create_event(false).unwrap();
        sim.set_event(event).unwrap();

        let first = sim.wait_for_any(&[event], Some(Duration::ZERO)).unwrap();
        let second = sim.wait_for_any(&[event], Some(Duration::ZERO)).unwrap();
        assert_eq!(first, WaitOutcome::Signaled(0));
        assert_eq!(second, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_wakes_on_process_exit() {
        let sim = SimulatedPlatform::new();
        let child = sim.spawn_process();
        let handle = sim.open_process(child, ProcessAccess::Synchronize).unwrap();

        let waiter = {
            let sim = sim.clone();
            std::thread::spawn(move || sim.wait_for_any(&[handle], None))
        };
        std::thread::sleep(Duration::from_millis(20));
        sim.exit_process(child);

        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Signaled(0));
    }

    #[test]
    fn test_creation_time_survives_while_handle_is_open() {
        let sim = SimulatedPlatform::new();
        let child = sim.spawn_process();
        let handle = sim.open_process(child, ProcessAccess::QueryLimited).unwrap();
        sim.exit_process(child);

        assert!(!sim.process_exists(child));
        assert!(sim.process_creation_time(child).unwrap().is_some());

        sim.close_handle(handle).unwrap();
        assert!(sim.process_creation_time(child).unwrap().is_none());
    }

    #[test]
    fn test_injected_wait_failure() {
        let sim = SimulatedPlatform::new();
        let event = sim.create_event(false).unwrap();
        sim.fail_next_waits(1);

        let err = sim.wait_for_any(&[event], Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.call, "WaitForMultipleObjects");
        assert!(err.is_invalid_handle());
    }

    #[test]
    fn test_launch_records_user_and_hook() {
        let sim = SimulatedPlatform::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sim.on_launch(move |record| sink.lock().push(record.pid));

        let token = sim.desktop_user_token().unwrap().unwrap();
        let launched = sim
            .create_process_as_user(
                Some(token),
                &LaunchRequest {
                    command: "child.exe".into(),
                    ..LaunchRequest::default()
                },
            )
            .unwrap();

        assert_eq!(*seen.lock(), vec![launched.pid]);
        assert_eq!(sim.launches()[0].user.as_deref(), Some("user"));
        assert!(sim.process_exists(launched.pid));
    }
}
