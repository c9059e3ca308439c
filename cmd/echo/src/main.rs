//! TCP echo server on the silk runtime.
//!
//! Every call that looks blocking below (`accept`, `read`, `write`) actually
//! suspends the calling coroutine and frees the worker thread.
//!
//! ```text
//! cargo run -p echo -- 8522
//! printf 'hello\n' | nc 127.0.0.1 8522
//! ```

use std::mem;
use std::sync::Arc;

use libc::{c_int, c_void, socklen_t};
use silk::{hook, kerror, kinfo, scheduler, IoManager, ScheduledTask};

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8522);

    let iom = IoManager::new("echo", 2, true);
    scheduler::schedule(&iom, ScheduledTask::call(move || serve(port)));

    // The caller thread joins the dispatch loop here and serves until the
    // process is killed.
    scheduler::stop(&iom);
}

fn serve(port: u16) {
    let listen_fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if listen_fd < 0 {
        kerror!("echo: socket failed");
        return;
    }

    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            listen_fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        );
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::bind(
            listen_fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as socklen_t,
        )
    };
    if ret != 0 {
        kerror!("echo: bind on port {} failed", port);
        hook::close(listen_fd);
        return;
    }
    if unsafe { libc::listen(listen_fd, 128) } != 0 {
        kerror!("echo: listen failed");
        hook::close(listen_fd);
        return;
    }
    kinfo!("echo: listening on 0.0.0.0:{}", port);

    loop {
        let client = hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut());
        if client < 0 {
            kerror!("echo: accept failed");
            continue;
        }
        let Some(iom) = IoManager::current() else {
            kerror!("echo: no reactor on accept thread");
            hook::close(client);
            continue;
        };
        schedule_client(&iom, client);
    }
}

fn schedule_client(iom: &Arc<IoManager>, client: c_int) {
    scheduler::schedule(iom, ScheduledTask::call(move || echo_client(client)));
}

fn echo_client(fd: c_int) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let m = hook::write(fd, &buf[off..n as usize]);
            if m <= 0 {
                hook::close(fd);
                return;
            }
            off += m as usize;
        }
    }
    hook::close(fd);
}
