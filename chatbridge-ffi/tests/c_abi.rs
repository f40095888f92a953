//! Drives the exported C functions the way a C host would.

use std::ffi::{CStr, c_char, c_void};
use std::ptr;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use chatbridge_ffi::{
    ChatBorrowedBuffer, ChatOwnedBuffer, ChatResponse, chatbridge_destroy, chatbridge_free_buffer,
    chatbridge_init, chatbridge_init_logger, chatbridge_last_error_length,
    chatbridge_last_error_message, chatbridge_start, chatbridge_start_with_context,
    chatbridge_submit_command, chatbridge_submit_command_with_id, chatbridge_upload_media,
    chatbridge_upload_media_bytes, chatbridge_upload_media_path,
};

type Seen = mpsc::Sender<(String, i64, Vec<u8>)>;

unsafe extern "C" fn on_event(command: *const c_char, request_id: i64, data: ChatOwnedBuffer, ctx: *mut c_void) {
    let name = unsafe { CStr::from_ptr(command) }.to_string_lossy().into_owned();
    let bytes = unsafe { data.as_slice() }.to_vec();
    unsafe { chatbridge_free_buffer(data) };
    let tx = unsafe { &*ctx.cast::<Seen>() };
    let _ = tx.send((name, request_id, bytes));
}

unsafe extern "C" fn ignore_event(_: *const c_char, _: i64, data: ChatOwnedBuffer) {
    unsafe { chatbridge_free_buffer(data) };
}

/// Copy out and release a response.
fn take(resp: ChatResponse) -> (String, Vec<u8>) {
    let name = unsafe { CStr::from_ptr(resp.command) }
        .to_string_lossy()
        .into_owned();
    let data = unsafe { resp.buf.as_slice() }.to_vec();
    unsafe { chatbridge_free_buffer(resp.buf) };
    (name, data)
}

fn last_error() -> String {
    let len = chatbridge_last_error_length();
    assert!(len > 0, "no last error recorded");
    let mut buf = vec![0 as c_char; usize::try_from(len).unwrap()];
    unsafe { chatbridge_last_error_message(buf.as_mut_ptr(), len) };
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn started() -> (usize, Box<Seen>, mpsc::Receiver<(String, i64, Vec<u8>)>) {
    let h = chatbridge_init();
    assert_ne!(h, 0);
    let (tx, rx) = mpsc::channel();
    let tx = Box::new(tx);
    let ctx = ptr::from_ref::<Seen>(&tx).cast_mut().cast::<c_void>();
    assert_eq!(unsafe { chatbridge_start_with_context(h, Some(on_event), ctx) }, 0);
    for _ in 0..4 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    (h, tx, rx)
}

#[test]
fn ping_round_trip() {
    assert_eq!(unsafe { chatbridge_init_logger(c"warn".as_ptr()) }, 0);
    let (h, tx, _rx) = started();

    let payload = br#"{"hello":"world"}"#;
    let resp = unsafe {
        chatbridge_submit_command(h, c"ping".as_ptr(), ChatBorrowedBuffer::from_slice(payload))
    };
    let first_name = resp.command;
    assert_eq!(take(resp), ("ping".to_owned(), payload.to_vec()));

    let again = unsafe { chatbridge_submit_command(h, c"ping".as_ptr(), ChatBorrowedBuffer::EMPTY) };
    assert_eq!(again.command, first_name, "command names are interned");
    assert!(again.buf.base.is_null());
    let _ = take(again);

    chatbridge_destroy(h);
    drop(tx);
}

#[test]
fn follow_up_events_carry_request_id() {
    let (h, tx, rx) = started();
    let resp = unsafe {
        chatbridge_submit_command_with_id(
            h,
            c"send_message".as_ptr(),
            42,
            ChatBorrowedBuffer::from_slice(br#"{"room_id":"!r","text":"yo"}"#),
        )
    };
    assert_eq!(take(resp).0, "send_message");
    let (name, request_id, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((name.as_str(), request_id), ("send_complete", 42));
    chatbridge_destroy(h);
    drop(tx);
}

#[test]
fn start_errors_are_reported_by_code() {
    let h = chatbridge_init();
    assert_eq!(unsafe { chatbridge_start(h, None) }, 5);
    assert_eq!(last_error(), "null callback pointer");

    assert_eq!(unsafe { chatbridge_start(h, Some(ignore_event)) }, 0);
    assert_eq!(unsafe { chatbridge_start(h, Some(ignore_event)) }, 2);
    assert_eq!(last_error(), "instance already started");

    chatbridge_destroy(h);
    assert_eq!(unsafe { chatbridge_start(h, Some(ignore_event)) }, 1);
    assert_eq!(unsafe { chatbridge_start(0, Some(ignore_event)) }, 1);
}

#[test]
fn misuse_yields_error_responses() {
    let (name, data) = take(unsafe {
        chatbridge_submit_command(0, c"ping".as_ptr(), ChatBorrowedBuffer::EMPTY)
    });
    assert_eq!(name, "error");
    assert_eq!(data, br#""unknown instance handle 0""#);
    assert_eq!(last_error(), "unknown instance handle 0");

    let (h, tx, _rx) = started();
    let (name, _) = take(unsafe { chatbridge_submit_command(h, ptr::null(), ChatBorrowedBuffer::EMPTY) });
    assert_eq!(name, "error");
    assert_eq!(last_error(), "null command pointer");

    let dangling = ChatBorrowedBuffer {
        base: ptr::null(),
        length: 3,
    };
    let (name, _) = take(unsafe { chatbridge_submit_command(h, c"ping".as_ptr(), dangling) });
    assert_eq!(name, "error");

    let (name, data) = take(unsafe {
        chatbridge_submit_command(h, c"teleport".as_ptr(), ChatBorrowedBuffer::EMPTY)
    });
    assert_eq!(name, "error");
    assert_eq!(data, br#""unknown command \"teleport\"""#);

    chatbridge_destroy(h);
    chatbridge_destroy(h);
    let (name, _) = take(unsafe { chatbridge_submit_command(h, c"ping".as_ptr(), ChatBorrowedBuffer::EMPTY) });
    assert_eq!(name, "error");
    drop(tx);
}

static PLAIN_PROGRESS: Mutex<Vec<f64>> = Mutex::new(Vec::new());

unsafe extern "C" fn record_plain(v: f64) {
    PLAIN_PROGRESS.lock().unwrap().push(v);
}

unsafe extern "C" fn record_ctx(v: f64, ctx: *mut c_void) {
    let seen = unsafe { &*ctx.cast::<Mutex<Vec<f64>>>() };
    seen.lock().unwrap().push(v);
}

#[test]
fn uploads_in_all_three_modes() {
    let (h, tx, _rx) = started();

    // Bytes mode with a zero-length, non-null media buffer.
    let empty: [u8; 0] = [];
    let (name, data) = take(unsafe {
        chatbridge_upload_media_bytes(
            h,
            ChatBorrowedBuffer::from_slice(br#"{"filename":"a.bin"}"#),
            ChatBorrowedBuffer::from_slice(&empty),
            Some(record_plain),
        )
    });
    assert_eq!(name, "upload_media");
    let body: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(body["size"], 0);
    assert_eq!(*PLAIN_PROGRESS.lock().unwrap(), vec![100.0]);

    // Path mode, no progress sink.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("photo.jpg");
    std::fs::write(&path, vec![7u8; 1000]).unwrap();
    let params = serde_json::to_vec(&serde_json::json!({ "path": path })).unwrap();
    let (name, data) = take(unsafe {
        chatbridge_upload_media_path(h, ChatBorrowedBuffer::from_slice(&params), None)
    });
    assert_eq!(name, "upload_media");
    let body: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(body["filename"], "photo.jpg");
    assert_eq!(body["size"], 1000);

    // Context mode: a null media base selects the path.
    let seen = Mutex::new(Vec::<f64>::new());
    let ctx = ptr::from_ref(&seen).cast_mut().cast::<c_void>();
    let (name, _) = take(unsafe {
        chatbridge_upload_media(
            h,
            ChatBorrowedBuffer::from_slice(&params),
            ChatBorrowedBuffer::EMPTY,
            Some(record_ctx),
            ctx,
        )
    });
    assert_eq!(name, "upload_media");
    assert_eq!(seen.into_inner().unwrap(), vec![100.0]);

    chatbridge_destroy(h);
    drop(tx);
}
