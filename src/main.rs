//! CLI entry point — C6, the accept loop / entry point, plus the ambient
//! config/logging/signal wiring spec.md frames as external collaborators
//! (argv parsing, signal setup) but SPEC_FULL.md §4.8/§4.9 pins down
//! concretely. Grounded directly in `original_source/main.c`: same usage
//! contract, same `SIGPIPE`/`SIGINT` handling, same "Server closed."
//! shutdown message.

use std::mem;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::FromRawFd;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{error, info};

use cacherelay::cache::Cache;
use cacherelay::client::ClientConn;
use cacherelay::mux::{Mux, MuxHandle};

/// Set once at startup so the `SIGINT` handler — which, like the
/// original's, runs with nothing but process-global state in scope — can
/// reach the poll thread and ask it to shut down.
static MUX_HANDLE: OnceCell<MuxHandle> = OnceCell::new();
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

const LISTEN_BACKLOG: i32 = 50;

extern "C" fn handle_sigint(_signum: libc::c_int) {
    if SHUTTING_DOWN.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(handle) = MUX_HANDLE.get() {
        handle.request_shutdown();
    }
}

fn install_signal_handlers() {
    // SAFETY: both calls install a plain C function pointer with `signal(2)`
    // semantics; this mirrors `original_source/main.c`'s
    // `signal(SIGPIPE, SIG_IGN)` / `signal(SIGINT, &interrupt_handler)`.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

/// Open, bind and listen on an IPv4 TCP socket with an explicit backlog,
/// then hand it to `mio` as non-blocking. `mio::net::TcpListener::bind`
/// does not expose backlog control, and spec.md §6 pins the backlog at 50
/// (matching `original_source/main.c`'s raw `socket`/`bind` sequence), so
/// the raw syscalls are made directly here rather than through `mio`.
fn bind_listener(port: u16) -> std::io::Result<StdTcpListener> {
    // SAFETY: standard BSD sockets sequence; every return value is checked
    // before the fd is trusted, and the fd is wrapped in `StdTcpListener`
    // (which owns and closes it) before this function returns.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let reuseaddr: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuseaddr as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

        let bind_result = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if bind_result != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, LISTEN_BACKLOG) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let listener = StdTcpListener::from_raw_fd(fd);
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

fn run(port: u16) -> std::io::Result<()> {
    info!(port, "binding server socket listener");
    let std_listener = bind_listener(port)?;
    let listener = mio::net::TcpListener::from_std(std_listener);
    info!("server socket bound");

    let cache = Arc::new(Cache::new());
    let mux = Mux::new().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let handle = mux.handle();
    MUX_HANDLE
        .set(handle.clone())
        .unwrap_or_else(|_| panic!("run() called more than once"));

    install_signal_handlers();

    let cache_for_accept = Arc::clone(&cache);
    mux.run(listener, move |mux_handle, stream, addr| {
        info!(%addr, "client accepted");
        if let Err(e) = ClientConn::accept(mux_handle, Arc::clone(&cache_for_accept), stream) {
            error!(%addr, error = %e, "failed to register accepted client");
        }
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    // `cache` is dropped here along with every entry still reachable only
    // through it — the Rust equivalent of the original's explicit
    // `cache_free()` call in `interrupt_handler`.
    drop(cache);
    println!("Server closed.");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <listen-port>", args.first().map(String::as_str).unwrap_or("cacherelay"));
        return ExitCode::from(255);
    }

    let port: u16 = match args[1].parse() {
        Ok(p) => p,
        Err(_) => {
            eprintln!("Usage: {} <listen-port>", args[0]);
            return ExitCode::from(255);
        }
    };

    match run(port) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            ExitCode::from(255)
        }
    }
}
