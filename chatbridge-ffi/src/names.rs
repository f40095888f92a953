//! Interned command names.
//!
//! Every command name that leaves the library (in a response or an event) is
//! a `&'static CStr` taken from this table, so C callers can hold on to the
//! pointer forever and never free it. Each distinct name is allocated once.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::{Mutex, OnceLock};

use crate::ffi::lock;

/// Name used for failed replies.
pub const ERROR: &CStr = c"error";

const BUILTIN: &[&CStr] = &[
    ERROR,
    c"ping",
    c"get_state",
    c"get_account_info",
    c"send_message",
    c"upload_media",
    c"client_state",
    c"sync_status",
    c"sync_complete",
    c"init_complete",
    c"send_complete",
];

static NAMES: OnceLock<Mutex<HashMap<String, &'static CStr>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<String, &'static CStr>> {
    NAMES.get_or_init(|| {
        let map = BUILTIN
            .iter()
            .map(|name| (name.to_string_lossy().into_owned(), *name))
            .collect();
        Mutex::new(map)
    })
}

/// Return the process-lifetime C string for `name`.
///
/// Names containing an interior NUL cannot be represented and map to [`ERROR`].
pub fn intern(name: &str) -> &'static CStr {
    let mut names = lock(table());
    if let Some(existing) = names.get(name) {
        return existing;
    }
    let Ok(owned) = CString::new(name) else {
        tracing::warn!(name, "Command name contains NUL, reporting as error");
        return ERROR;
    };
    let leaked: &'static CStr = Box::leak(owned.into_boxed_c_str());
    names.insert(name.to_owned(), leaked);
    leaked
}
