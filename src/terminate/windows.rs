//! WM_CLOSE, console control events and Toolhelp32 enumeration

use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HWND, INVALID_HANDLE_VALUE, LPARAM};
use windows_sys::Win32::System::Console::{
    AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, SetConsoleCtrlHandler, CTRL_C_EVENT,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowThreadProcessId, PostMessageW, WM_CLOSE,
};

use super::{ProcessEntry, ProcessTable};
use crate::error::ServiceError;

/// Exit code handed to forcibly terminated processes
const KILLED_EXIT_CODE: u32 = 1;

fn last_error(operation: &str) -> ServiceError {
    let err = io::Error::last_os_error();
    ServiceError::native(operation, err.raw_os_error().unwrap_or(-1), err.to_string())
}

struct CloseRequest {
    pid: u32,
    posted: bool,
}

unsafe extern "system" fn post_close(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let request = &mut *(lparam as *mut CloseRequest);
    let mut owner = 0u32;
    GetWindowThreadProcessId(hwnd, &mut owner);
    if owner == request.pid && PostMessageW(hwnd, WM_CLOSE, 0, 0) != 0 {
        request.posted = true;
    }
    1
}

/// Post WM_CLOSE to every top-level window of `pid`
pub fn request_close(pid: u32) -> bool {
    let mut request = CloseRequest { pid, posted: false };
    unsafe {
        EnumWindows(Some(post_close), &mut request as *mut CloseRequest as LPARAM);
    }
    request.posted
}

/// Deliver Ctrl+C to the console `pid` is attached to
pub fn interrupt(pid: u32) -> bool {
    unsafe {
        if AttachConsole(pid) == 0 {
            return false;
        }
        // Keep the event from stopping us as well
        SetConsoleCtrlHandler(None, 1);
        let sent = GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) != 0;
        FreeConsole();
        SetConsoleCtrlHandler(None, 0);
        sent
    }
}

/// TerminateProcess on a pid
pub fn kill(pid: u32) -> Result<(), ServiceError> {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(last_error("OpenProcess"));
        }
        let ok = TerminateProcess(handle, KILLED_EXIT_CODE) != 0;
        let err = (!ok).then(|| last_error("TerminateProcess"));
        CloseHandle(handle);
        err.map_or(Ok(()), Err)
    }
}

/// Process table from a Toolhelp32 snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolhelpTable;

impl ProcessTable for ToolhelpTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ServiceError> {
        let mut entries = Vec::new();
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
            if snapshot == INVALID_HANDLE_VALUE {
                return Err(last_error("CreateToolhelp32Snapshot"));
            }
            let mut entry: PROCESSENTRY32W = std::mem::zeroed();
            entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
            let mut more = Process32FirstW(snapshot, &mut entry) != 0;
            while more {
                entries.push(ProcessEntry {
                    pid: entry.th32ProcessID,
                    ppid: entry.th32ParentProcessID,
                });
                more = Process32NextW(snapshot, &mut entry) != 0;
            }
            CloseHandle(snapshot);
        }
        Ok(entries)
    }

    fn kill(&self, pid: u32) -> Result<(), ServiceError> {
        kill(pid)
    }
}
