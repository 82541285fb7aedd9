//! # Win32 Platform
//!
//! [`Platform`] over kernel32, advapi32, wtsapi32 and userenv. Every failed
//! call becomes a [`PlatformError`] carrying `GetLastError()`.

use shared_types::{
    CreationToken, LaunchRequest, LaunchedProcess, Pid, Platform, PlatformError, PlatformResult,
    ProcessAccess, RawHandle, WaitOutcome, ERROR_NO_TOKEN,
};
use std::ffi::c_void;
use std::ptr;
use std::time::Duration;
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, GetLastError, LocalFree, FILETIME, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::Authorization::{
    GetSecurityInfo, SetEntriesInAclW, SetSecurityInfo, EXPLICIT_ACCESS_W, TRUSTEE_W,
};
use windows_sys::Win32::Security::{GetTokenInformation, ACL, TOKEN_LINKED_TOKEN, TOKEN_USER};
use windows_sys::Win32::Storage::FileSystem::CreateFileW;
use windows_sys::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows_sys::Win32::System::RemoteDesktop::{
    ProcessIdToSessionId, WTSGetActiveConsoleSessionId, WTSQueryUserToken,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateProcessAsUserW, CreateProcessW, GetCurrentProcess, GetProcessTimes,
    OpenProcess, OpenProcessToken, SetEvent, TerminateProcess, WaitForMultipleObjects,
    WaitForSingleObject, PROCESS_INFORMATION, STARTUPINFOW,
};

// winnt.h / winbase.h values.
const PROCESS_TERMINATE: u32 = 0x0001;
const PROCESS_DUP_HANDLE: u32 = 0x0040;
const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
const SYNCHRONIZE: u32 = 0x0010_0000;
const TOKEN_ASSIGN_PRIMARY: u32 = 0x0001;
const TOKEN_DUPLICATE: u32 = 0x0002;
const TOKEN_QUERY: u32 = 0x0008;
const TOKEN_USER_CLASS: i32 = 1;
const TOKEN_LINKED_TOKEN_CLASS: i32 = 19;
const DUPLICATE_SAME_ACCESS: u32 = 0x2;
const WAIT_OBJECT_0: u32 = 0;
const WAIT_ABANDONED_0: u32 = 0x80;
const WAIT_TIMEOUT: u32 = 0x102;
const INFINITE: u32 = 0xFFFF_FFFF;
const NO_CONSOLE_SESSION: u32 = 0xFFFF_FFFF;
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
const CREATE_UNICODE_ENVIRONMENT: u32 = 0x0000_0400;
const GENERIC_READ: u32 = 0x8000_0000;
const WRITE_DAC: u32 = 0x0004_0000;
const OPEN_EXISTING: u32 = 3;
const FILE_GENERIC_READ: u32 = 0x0012_0089;
const FILE_GENERIC_WRITE: u32 = 0x0012_0116;
const SE_KERNEL_OBJECT: i32 = 6;
const DACL_SECURITY_INFORMATION: u32 = 0x4;
const GRANT_ACCESS: i32 = 1;
const TRUSTEE_IS_SID: i32 = 0;
const TRUSTEE_IS_USER: i32 = 1;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

fn handle(raw: RawHandle) -> HANDLE {
    raw.0 as HANDLE
}

fn raw(handle: HANDLE) -> RawHandle {
    RawHandle(handle as u64)
}

fn last_error(call: &str, return_code: i64) -> PlatformError {
    // SAFETY: reads the calling thread's last-error value.
    let os_error = unsafe { GetLastError() };
    PlatformError::new(call, return_code, os_error)
}

fn check(call: &str, ok: i32) -> PlatformResult<()> {
    if ok == 0 {
        Err(last_error(call, i64::from(ok)))
    } else {
        Ok(())
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `NAME=value\0...\0\0`
fn environment_block(entries: &[String]) -> Vec<u16> {
    let mut block: Vec<u16> = entries
        .iter()
        .flat_map(|entry| entry.encode_utf16().chain(std::iter::once(0)))
        .collect();
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Closes a handle when dropped.
struct Guard(HANDLE);

impl Drop for Guard {
    fn drop(&mut self) {
        // SAFETY: the guard owns the handle.
        unsafe { CloseHandle(self.0) };
    }
}

/// The live Win32 system.
#[derive(Debug, Default)]
pub struct Win32Platform;

impl Win32Platform {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, pid: Pid, access: u32) -> PlatformResult<Guard> {
        // SAFETY: plain call; the result is checked.
        let process = unsafe { OpenProcess(access, 0, pid.0) };
        if process == 0 {
            return Err(last_error("OpenProcess", 0));
        }
        Ok(Guard(process))
    }

    fn own_token(&self) -> PlatformResult<RawHandle> {
        let mut token: HANDLE = 0;
        // SAFETY: the pseudo handle of the current process needs no closing.
        let ok = unsafe {
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ASSIGN_PRIMARY | TOKEN_DUPLICATE | TOKEN_QUERY,
                &mut token,
            )
        };
        check("OpenProcessToken", ok)?;
        Ok(raw(token))
    }

    /// Raw `GetTokenInformation` output for one information class.
    fn token_information(&self, token: RawHandle, class: i32) -> PlatformResult<Vec<u64>> {
        let mut length = 0u32;
        // SAFETY: a null buffer asks for the required length.
        let ok = unsafe {
            GetTokenInformation(handle(token), class as _, ptr::null_mut(), 0, &mut length)
        };
        if ok == 0 {
            // SAFETY: reads the thread's last error.
            let error = unsafe { GetLastError() };
            if error != ERROR_INSUFFICIENT_BUFFER {
                return Err(PlatformError::new("GetTokenInformation", 0, error));
            }
        }

        let mut buffer = vec![0u64; (length as usize).div_ceil(8)];
        // SAFETY: the buffer holds at least `length` bytes and is 8-byte aligned.
        let ok = unsafe {
            GetTokenInformation(
                handle(token),
                class as _,
                buffer.as_mut_ptr().cast::<c_void>(),
                length,
                &mut length,
            )
        };
        check("GetTokenInformation", ok)?;
        Ok(buffer)
    }

    fn grant_user(&self, pipe: HANDLE, sid: *mut c_void) -> PlatformResult<()> {
        let mut dacl: *mut ACL = ptr::null_mut();
        let mut descriptor: *mut c_void = ptr::null_mut();
        // SAFETY: out-pointers are valid; the descriptor owns `dacl` and is
        // freed below.
        let result = unsafe {
            GetSecurityInfo(
                pipe,
                SE_KERNEL_OBJECT as _,
                DACL_SECURITY_INFORMATION as _,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut dacl,
                ptr::null_mut(),
                &mut descriptor,
            )
        };
        if result != 0 {
            return Err(PlatformError::new("GetSecurityInfo", i64::from(result), result));
        }

        // SAFETY: a zeroed EXPLICIT_ACCESS_W is a valid starting point.
        let mut access: EXPLICIT_ACCESS_W = unsafe { std::mem::zeroed() };
        access.grfAccessPermissions = FILE_GENERIC_READ | FILE_GENERIC_WRITE;
        access.grfAccessMode = GRANT_ACCESS as _;
        access.grfInheritance = 0;
        access.Trustee = TRUSTEE_W {
            pMultipleTrustee: ptr::null_mut(),
            MultipleTrusteeOperation: 0,
            TrusteeForm: TRUSTEE_IS_SID as _,
            TrusteeType: TRUSTEE_IS_USER as _,
            ptstrName: sid.cast(),
        };

        let mut new_dacl: *mut ACL = ptr::null_mut();
        // SAFETY: `access` and `dacl` are valid for the call.
        let result = unsafe { SetEntriesInAclW(1, &access, dacl, &mut new_dacl) };
        let outcome = if result != 0 {
            Err(PlatformError::new("SetEntriesInAclW", i64::from(result), result))
        } else {
            // SAFETY: `new_dacl` was allocated by SetEntriesInAclW.
            let result = unsafe {
                SetSecurityInfo(
                    pipe,
                    SE_KERNEL_OBJECT as _,
                    DACL_SECURITY_INFORMATION as _,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    new_dacl,
                    ptr::null(),
                )
            };
            // SAFETY: allocated by SetEntriesInAclW.
            unsafe { LocalFree(new_dacl as _) };
            if result != 0 {
                Err(PlatformError::new("SetSecurityInfo", i64::from(result), result))
            } else {
                Ok(())
            }
        };

        // SAFETY: allocated by GetSecurityInfo.
        unsafe { LocalFree(descriptor as _) };
        outcome
    }
}

impl Platform for Win32Platform {
    fn open_process(&self, pid: Pid, access: ProcessAccess) -> PlatformResult<RawHandle> {
        let rights = match access {
            ProcessAccess::DuplicateHandle => PROCESS_DUP_HANDLE,
            ProcessAccess::Synchronize => SYNCHRONIZE,
            ProcessAccess::QueryLimited => PROCESS_QUERY_LIMITED_INFORMATION,
        };
        let process = self.open(pid, rights)?;
        let value = raw(process.0);
        std::mem::forget(process);
        Ok(value)
    }

    fn close_handle(&self, raw_handle: RawHandle) -> PlatformResult<()> {
        // SAFETY: the caller owns the handle.
        check("CloseHandle", unsafe { CloseHandle(handle(raw_handle)) })
    }

    fn duplicate_handle_into(
        &self,
        source: RawHandle,
        target_process: RawHandle,
    ) -> PlatformResult<RawHandle> {
        let mut target: HANDLE = 0;
        // SAFETY: both handles are owned by the caller.
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                handle(source),
                handle(target_process),
                &mut target,
                0,
                0,
                DUPLICATE_SAME_ACCESS as _,
            )
        };
        check("DuplicateHandle", ok)?;
        Ok(raw(target))
    }

    fn create_event(&self, manual_reset: bool) -> PlatformResult<RawHandle> {
        // SAFETY: unnamed event with default security.
        let event = unsafe { CreateEventW(ptr::null(), i32::from(manual_reset), 0, ptr::null()) };
        if event == 0 {
            return Err(last_error("CreateEvent", 0));
        }
        Ok(raw(event))
    }

    fn set_event(&self, event: RawHandle) -> PlatformResult<()> {
        // SAFETY: plain call on a caller-owned handle.
        check("SetEvent", unsafe { SetEvent(handle(event)) })
    }

    fn wait_for_any(
        &self,
        handles: &[RawHandle],
        timeout: Option<Duration>,
    ) -> PlatformResult<WaitOutcome> {
        let handles: Vec<HANDLE> = handles.iter().copied().map(handle).collect();
        let millis = timeout.map_or(INFINITE, |t| u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1));
        let count = handles.len() as u32;
        // SAFETY: `handles` outlives the call.
        let result = unsafe { WaitForMultipleObjects(count, handles.as_ptr(), 0, millis) };
        match result {
            r if r < WAIT_OBJECT_0 + count => Ok(WaitOutcome::Signaled(r as usize)),
            r if r >= WAIT_ABANDONED_0 && r < WAIT_ABANDONED_0 + count => {
                Ok(WaitOutcome::Signaled((r - WAIT_ABANDONED_0) as usize))
            }
            WAIT_TIMEOUT => Ok(WaitOutcome::TimedOut),
            r => Err(last_error("WaitForMultipleObjects", i64::from(r))),
        }
    }

    fn process_creation_time(&self, pid: Pid) -> PlatformResult<Option<CreationToken>> {
        let Ok(process) = self.open(pid, PROCESS_QUERY_LIMITED_INFORMATION) else {
            return Ok(None);
        };
        let mut created = FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        let mut exited = created;
        let mut kernel = created;
        let mut user = created;
        // SAFETY: all out-pointers are valid.
        let ok = unsafe {
            GetProcessTimes(process.0, &mut created, &mut exited, &mut kernel, &mut user)
        };
        check("GetProcessTimes", ok)?;
        let token = (u64::from(created.dwHighDateTime) << 32) | u64::from(created.dwLowDateTime);
        Ok(Some(CreationToken(token)))
    }

    fn process_exists(&self, pid: Pid) -> bool {
        match self.open(pid, SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION) {
            // SAFETY: zero-timeout wait on an owned handle.
            Ok(process) => unsafe { WaitForSingleObject(process.0, 0) } == WAIT_TIMEOUT,
            Err(e) => {
                // Access denied still means something has the PID.
                e.is_access_denied()
            }
        }
    }

    fn terminate_process(&self, pid: Pid) -> PlatformResult<()> {
        let process = self.open(pid, PROCESS_TERMINATE)?;
        // SAFETY: owned handle with terminate access.
        check("TerminateProcess", unsafe { TerminateProcess(process.0, 1) })
    }

    fn is_service(&self) -> bool {
        let mut session = 0u32;
        // SAFETY: valid out-pointer.
        let ok = unsafe { ProcessIdToSessionId(std::process::id(), &mut session) };
        if ok == 0 {
            warn!(error = %last_error("ProcessIdToSessionId", 0), "Unable to get the session id");
            return false;
        }
        // Services run in session 0.
        session == 0
    }

    fn desktop_user_token(&self) -> PlatformResult<Option<RawHandle>> {
        if !self.is_service() {
            return self.own_token().map(Some);
        }

        // SAFETY: plain call.
        let session = unsafe { WTSGetActiveConsoleSessionId() };
        debug!(session, "Console session");
        if session == NO_CONSOLE_SESSION {
            return Ok(None);
        }

        let mut token: HANDLE = 0;
        // SAFETY: valid out-pointer.
        let ok = unsafe { WTSQueryUserToken(session, &mut token) };
        if ok != 0 {
            return Ok(Some(raw(token)));
        }
        // SAFETY: reads the thread's last error.
        match unsafe { GetLastError() } {
            0 | ERROR_NO_TOKEN => Ok(None),
            error => Err(PlatformError::new("WTSQueryUserToken", 0, error)),
        }
    }

    fn elevated_token(&self, token: RawHandle) -> PlatformResult<RawHandle> {
        let buffer = self.token_information(token, TOKEN_LINKED_TOKEN_CLASS)?;
        // SAFETY: the buffer holds a TOKEN_LINKED_TOKEN.
        let linked = unsafe { &*buffer.as_ptr().cast::<TOKEN_LINKED_TOKEN>() };
        Ok(raw(linked.LinkedToken))
    }

    fn user_environment(&self, token: Option<RawHandle>) -> PlatformResult<Vec<String>> {
        let Some(token) = token else {
            return Ok(std::env::vars()
                .map(|(name, value)| format!("{name}={value}"))
                .collect());
        };

        let mut block: *mut c_void = ptr::null_mut();
        // SAFETY: valid out-pointer; the block is destroyed below.
        let ok = unsafe { CreateEnvironmentBlock(&mut block, handle(token), 0) };
        check("CreateEnvironmentBlock", ok)?;

        let mut entries = Vec::new();
        let mut cursor = block.cast::<u16>().cast_const();
        // SAFETY: the block is a sequence of NUL-terminated strings ended by
        // an empty one.
        unsafe {
            loop {
                let mut len = 0;
                while *cursor.add(len) != 0 {
                    len += 1;
                }
                if len == 0 {
                    break;
                }
                let entry = std::slice::from_raw_parts(cursor, len);
                entries.push(String::from_utf16_lossy(entry));
                cursor = cursor.add(len + 1);
            }
            DestroyEnvironmentBlock(block);
        }
        Ok(entries)
    }

    fn create_process_as_user(
        &self,
        token: Option<RawHandle>,
        request: &LaunchRequest,
    ) -> PlatformResult<LaunchedProcess> {
        let mut command = wide(&request.command);
        let environment = environment_block(&request.environment);
        let current_dir = request
            .current_dir
            .as_ref()
            .map(|dir| wide(&dir.to_string_lossy()));
        let mut desktop = wide("winsta0\\default");

        // SAFETY: a zeroed STARTUPINFOW is valid once `cb` is set.
        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        startup.lpDesktop = desktop.as_mut_ptr();
        // SAFETY: filled in by the call.
        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let mut flags = CREATE_UNICODE_ENVIRONMENT;
        if request.new_console {
            flags |= CREATE_NEW_CONSOLE;
        }
        let dir_ptr = current_dir.as_ref().map_or(ptr::null(), |dir| dir.as_ptr());
        let inherit = i32::from(request.inherit_handles);

        // SAFETY: every buffer outlives the call; `command` is mutable as
        // CreateProcess requires.
        let ok = unsafe {
            match token {
                Some(token) => CreateProcessAsUserW(
                    handle(token),
                    ptr::null(),
                    command.as_mut_ptr(),
                    ptr::null(),
                    ptr::null(),
                    inherit,
                    flags as _,
                    environment.as_ptr().cast(),
                    dir_ptr,
                    &startup,
                    &mut info,
                ),
                None => CreateProcessW(
                    ptr::null(),
                    command.as_mut_ptr(),
                    ptr::null(),
                    ptr::null(),
                    inherit,
                    flags as _,
                    environment.as_ptr().cast(),
                    dir_ptr,
                    &startup,
                    &mut info,
                ),
            }
        };
        let call = if token.is_some() {
            "CreateProcessAsUser"
        } else {
            "CreateProcess"
        };
        check(call, ok)?;

        Ok(LaunchedProcess {
            pid: Pid(info.dwProcessId),
            process_handle: raw(info.hProcess),
            thread_handle: raw(info.hThread),
        })
    }

    fn grant_pipe_access(&self, pipe_name: &str) -> PlatformResult<()> {
        let token = self
            .desktop_user_token()?
            .ok_or_else(|| PlatformError::new("WTSQueryUserToken", 0, ERROR_NO_TOKEN))?;
        let token_user = {
            let _token = Guard(handle(token));
            self.token_information(token, TOKEN_USER_CLASS)?
        };
        // SAFETY: the buffer holds a TOKEN_USER whose SID points into it.
        let sid = unsafe { (*token_user.as_ptr().cast::<TOKEN_USER>()).User.Sid };

        let name = wide(pipe_name);
        // SAFETY: `name` is NUL-terminated.
        let pipe = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | WRITE_DAC,
                0,
                ptr::null(),
                OPEN_EXISTING as _,
                0,
                0,
            )
        };
        if pipe == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateFile", pipe as i64));
        }
        let pipe = Guard(pipe);
        self.grant_user(pipe.0, sid.cast())
    }
}
