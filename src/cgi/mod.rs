//! The CGI/1.1 sub-process gateway: spawns an interpreter (or the script
//! itself), feeds the request body over a pipe, collects stdout with a
//! timeout, and turns the captured headers+body into an HTTP [`Response`].

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, close, dup2, fork, pipe, read, write, ForkResult, Pid};
use thiserror::Error;

use crate::config::policy;
use crate::http::handlers::RequestContext;
use crate::http::response::Response;
use crate::http::Request;

/// How long the parent waits, from spawn to child-stdout EOF, before it
/// kills and reaps the child, per §5 "CGI: 5s from spawn to child-stdout EOF".
const CGI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("CGI script timed out")]
    Timeout,
    #[error("CGI script produced no usable output")]
    InvalidOutput,
    #[error("failed to execute CGI script: {0}")]
    Exec(#[from] std::io::Error),
    #[error("CGI script exited with status {0}")]
    ExitFailure(i32),
}

impl CgiError {
    pub fn status_code(&self) -> u16 {
        match self {
            CgiError::Timeout => 504,
            CgiError::InvalidOutput => 502,
            CgiError::Exec(_) | CgiError::ExitFailure(_) => 500,
        }
    }
}

/// Build the CGI/1.1 environment for `request`, executed through `script`
/// under `ctx`, as seen by a peer at `client_ip`. See §4.6.
fn build_environment(
    script: &Path,
    request: &Request,
    ctx: &RequestContext,
    client_ip: &str,
    local_port: u16,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("REQUEST_METHOD".into(), request.method.as_str().to_string());

    let query_string = request
        .query
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                crate::utils::percent_encode_query(k),
                crate::utils::percent_encode_query(v)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    env.insert("QUERY_STRING".into(), query_string);
    env.insert("PATH_INFO".into(), request.path.clone());
    env.insert("SCRIPT_NAME".into(), script.display().to_string());
    env.insert("SCRIPT_FILENAME".into(), script.display().to_string());
    env.insert("SERVER_PROTOCOL".into(), request.version.clone());
    env.insert(
        "CONTENT_TYPE".into(),
        request.header("content-type").unwrap_or("").to_string(),
    );
    env.insert(
        "CONTENT_LENGTH".into(),
        request.body.len().to_string(),
    );
    env.insert("HTTP_HOST".into(), request.header("host").unwrap_or("").to_string());
    env.insert(
        "HTTP_COOKIE".into(),
        request.header("cookie").unwrap_or("").to_string(),
    );

    let server_name = request
        .header("host")
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| ctx.server.server_names.first().cloned())
        .unwrap_or_else(|| "localhost".to_string());
    env.insert("SERVER_NAME".into(), server_name);
    env.insert("SERVER_PORT".into(), local_port.to_string());
    env.insert("REMOTE_ADDR".into(), client_ip.to_string());
    env.insert("REDIRECT_STATUS".into(), "200".to_string());
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".to_string());
    env.insert("DOCUMENT_ROOT".into(), ctx.root.clone());

    for (name, value) in &request.headers {
        let upper = name.to_ascii_uppercase().replace('-', "_");
        env.insert(format!("HTTP_{upper}"), value.clone());
    }

    env
}

fn interpreter_for(script: &Path, ctx: &RequestContext) -> Option<String> {
    let ext = script.extension()?.to_str()?;
    let ext = format!(".{ext}");
    policy::effective_cgi_pass(ctx.location, ctx.server, &ext).map(|s| s.to_string())
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = OFlag::from_bits_truncate(fcntl(borrowed, FcntlArg::F_GETFL)?);
    fcntl(borrowed, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Spawn `script` (through its mapped interpreter, if any), pipe `request`'s
/// body to its stdin, and turn its stdout into an HTTP response.
pub fn execute(
    script: &Path,
    request: &Request,
    ctx: &RequestContext,
    client_ip: &str,
    local_port: u16,
) -> Response {
    match run(script, request, ctx, client_ip, local_port) {
        Ok(resp) => resp,
        Err(err) => crate::http::response::error_response(err.status_code(), ctx.location, ctx.server),
    }
}

fn run(
    script: &Path,
    request: &Request,
    ctx: &RequestContext,
    client_ip: &str,
    local_port: u16,
) -> Result<Response, CgiError> {
    let env = build_environment(script, request, ctx, client_ip, local_port);
    let interpreter = interpreter_for(script, ctx);
    let script_dir = script
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let (stdin_read, stdin_write) = pipe().map_err(to_io_error)?;
    let (stdout_read, stdout_write) = pipe().map_err(to_io_error)?;
    // Pipes are taken over as raw fds: both ends in both the parent and the
    // child must survive past the `OwnedFd` that created them and be closed
    // explicitly on each side, matching §4.6's "close all inherited fds" step.
    let stdin_read = stdin_read.into_raw_fd();
    let stdin_write = stdin_write.into_raw_fd();
    let stdout_read = stdout_read.into_raw_fd();
    let stdout_write = stdout_write.into_raw_fd();

    // SAFETY: `fork` is safe to call here because the child's only path
    // forward is dup2/close/chdir/execv, all async-signal-safe, followed by
    // an immediate `_exit` on any failure - no Rust allocator or destructor
    // runs between fork and exec in the child.
    match unsafe { fork() }.map_err(to_io_error)? {
        ForkResult::Child => {
            let _ = dup2(stdin_read, 0);
            let _ = dup2(stdout_write, 1);
            let _ = close(stdin_read);
            let _ = close(stdin_write);
            let _ = close(stdout_read);
            let _ = close(stdout_write);
            let _ = chdir(&script_dir);

            // A header value smuggling a NUL byte would make `CString::new`
            // fail; skip that one env entry rather than panic in the child.
            let envp: Vec<std::ffi::CString> = env
                .iter()
                .filter_map(|(k, v)| std::ffi::CString::new(format!("{k}={v}")).ok())
                .collect();

            let built: Option<(std::ffi::CString, Vec<std::ffi::CString>)> = match interpreter {
                Some(interp) => {
                    let program = std::ffi::CString::new(interp.clone()).ok();
                    let arg0 = std::ffi::CString::new(interp).ok();
                    let arg1 = std::ffi::CString::new(script.as_os_str().to_string_lossy().as_bytes()).ok();
                    program.zip(arg0).zip(arg1).map(|((p, a0), a1)| (p, vec![a0, a1]))
                }
                None => std::ffi::CString::new(script.as_os_str().to_string_lossy().as_bytes())
                    .ok()
                    .map(|program| {
                        let arg0 = program.clone();
                        (program, vec![arg0])
                    }),
            };

            if let Some((program, argv)) = built {
                let _ = execve_compat(&program, &argv, &envp);
            }
            // execve only returns on failure (or was skipped above).
            nix::unistd::_exit(1);
        }
        ForkResult::Parent { child } => {
            close(stdin_read).ok();
            close(stdout_write).ok();
            drive(child, stdin_write, stdout_read, &request.body)
        }
    }
}

/// `nix::unistd::execve` by way of `execv`-with-manual-env, since `execve`'s
/// signature wants `&CStr` environment slices built the same way.
fn execve_compat(
    program: &std::ffi::CString,
    argv: &[std::ffi::CString],
    envp: &[std::ffi::CString],
) -> nix::Result<std::convert::Infallible> {
    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();
    let envp_refs: Vec<&std::ffi::CStr> = envp.iter().map(|c| c.as_c_str()).collect();
    nix::unistd::execve(program, &argv_refs, &envp_refs)
}

fn to_io_error(errno: Errno) -> CgiError {
    CgiError::Exec(std::io::Error::from(errno))
}

/// Guarantees the pipe fds are closed and the child is reaped on every exit
/// path out of [`drive`], including the early returns from `?` on a failed
/// `register`/`poll`/`read`, per §5 "every opened descriptor ... must be
/// released on every exit path including failure paths". Unless [`Self::reap`]
/// has already run (the happy path, which waits without killing), dropping
/// the guard `SIGKILL`s and reaps the child the same way the timeout path does.
struct ChildGuard {
    child: Pid,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Pid, stdin_fd: RawFd, stdout_fd: RawFd) -> Self {
        ChildGuard {
            child,
            stdin_fd: Some(stdin_fd),
            stdout_fd: Some(stdout_fd),
            reaped: false,
        }
    }

    fn close_stdin(&mut self) {
        if let Some(fd) = self.stdin_fd.take() {
            let _ = close(fd);
        }
    }

    fn close_stdout(&mut self) {
        if let Some(fd) = self.stdout_fd.take() {
            let _ = close(fd);
        }
    }

    /// Reap the child on the happy path: no kill, just wait. Marks the guard
    /// so `Drop` does not try to wait on it again.
    fn reap(&mut self) -> nix::Result<WaitStatus> {
        let status = waitpid(self.child, None);
        self.reaped = true;
        status
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.close_stdin();
        self.close_stdout();
        if !self.reaped {
            let _ = kill(self.child, Signal::SIGKILL);
            let _ = waitpid(self.child, None);
        }
    }
}

/// Parent-side pump: write the body to `stdin_fd` (if any), drain
/// `stdout_fd` until EOF, bounded by [`CGI_TIMEOUT`]. Kills and reaps the
/// child on timeout; always reaps on the happy path. `guard` owns both pipe
/// fds and the child for the rest of this function's lifetime, so any early
/// return (via `?` or otherwise) still closes them and reaps the child.
fn drive(child: Pid, stdin_fd: RawFd, stdout_fd: RawFd, body: &[u8]) -> Result<Response, CgiError> {
    let mut guard = ChildGuard::new(child, stdin_fd, stdout_fd);

    set_nonblocking(stdin_fd).map_err(to_io_error)?;
    set_nonblocking(stdout_fd).map_err(to_io_error)?;

    let mut poll = Poll::new().map_err(CgiError::Exec)?;
    let mut events = Events::with_capacity(4);

    const STDIN_TOKEN: Token = Token(0);
    const STDOUT_TOKEN: Token = Token(1);

    let mut stdin_open = !body.is_empty();
    if stdin_open {
        poll.registry()
            .register(&mut SourceFd(&stdin_fd), STDIN_TOKEN, Interest::WRITABLE)
            .map_err(CgiError::Exec)?;
    } else {
        guard.close_stdin();
    }
    poll.registry()
        .register(&mut SourceFd(&stdout_fd), STDOUT_TOKEN, Interest::READABLE)
        .map_err(CgiError::Exec)?;

    let mut written = 0usize;
    let mut output = Vec::new();
    let deadline = Instant::now() + CGI_TIMEOUT;
    let mut eof = false;

    while !eof {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CgiError::Timeout);
        }
        poll.poll(&mut events, Some(remaining)).map_err(CgiError::Exec)?;

        for event in events.iter() {
            if event.token() == STDIN_TOKEN && stdin_open {
                match write(unsafe { BorrowedFd::borrow_raw(stdin_fd) }, &body[written..]) {
                    Ok(n) => {
                        written += n;
                        if written >= body.len() {
                            let _ = poll.registry().deregister(&mut SourceFd(&stdin_fd));
                            guard.close_stdin();
                            stdin_open = false;
                        }
                    }
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(_) => {
                        let _ = poll.registry().deregister(&mut SourceFd(&stdin_fd));
                        guard.close_stdin();
                        stdin_open = false;
                    }
                }
            }
            if event.token() == STDOUT_TOKEN {
                loop {
                    let mut chunk = [0u8; 8192];
                    match read(unsafe { BorrowedFd::borrow_raw(stdout_fd) }, &mut chunk) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => output.extend_from_slice(&chunk[..n]),
                        Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                        Err(e) => return Err(to_io_error(e)),
                    }
                }
            }
        }
    }

    guard.close_stdin();
    guard.close_stdout();

    // A non-zero exit with no output at all means the child's `execve`
    // itself failed (the `_exit(1)` fallback after a failed exec); per the
    // error-mapping table that's a 500, not a 502 "invalid output".
    if let Ok(WaitStatus::Exited(_, code)) = guard.reap() {
        if code != 0 && output.is_empty() {
            return Err(CgiError::ExitFailure(code));
        }
    }

    parse_output(&output)
}

/// Parse CGI output: an optional `HTTP/X Y Z` status line, then
/// `Name: Value` headers until a blank line, then the body. See §4.6.
fn parse_output(output: &[u8]) -> Result<Response, CgiError> {
    if output.is_empty() {
        return Err(CgiError::InvalidOutput);
    }

    let header_end = output
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .or_else(|| output.windows(2).position(|w| w == b"\n\n").map(|i| i + 2));

    let (head, body) = match header_end {
        Some(end) => (&output[..end], &output[end..]),
        None => (output, &output[output.len()..]),
    };

    let head_text = String::from_utf8_lossy(head);
    let mut lines = head_text.lines().peekable();

    let mut status = 200u16;
    if let Some(first) = lines.peek() {
        if let Some(rest) = first.strip_prefix("HTTP/") {
            let mut parts = rest.split_whitespace();
            parts.next(); // version
            if let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) {
                status = code;
                lines.next();
            }
        }
    }

    let mut response = Response::new(status);
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("set-cookie") {
            response = response.set_cookie(value);
        } else {
            response.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            response = response.header(name, value);
        }
    }

    Ok(response.body(body.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_invalid() {
        assert!(matches!(parse_output(b""), Err(CgiError::InvalidOutput)));
    }

    #[test]
    fn status_line_is_consumed() {
        let resp = parse_output(b"HTTP/1.1 302 Found\r\nLocation: /x\r\n\r\nbody").unwrap();
        assert_eq!(resp.status, 302);
        assert_eq!(resp.body, b"body");
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("location") && v == "/x"));
    }

    #[test]
    fn missing_status_line_defaults_to_200() {
        let resp = parse_output(b"Content-Type: text/plain\r\n\r\nhello").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn set_cookie_headers_go_to_their_own_list() {
        let resp = parse_output(b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n").unwrap();
        assert_eq!(resp.set_cookies, vec!["a=1".to_string(), "b=2".to_string()]);
    }

    #[test]
    fn error_status_codes_map_correctly() {
        assert_eq!(CgiError::Timeout.status_code(), 504);
        assert_eq!(CgiError::InvalidOutput.status_code(), 502);
        assert_eq!(CgiError::Exec(std::io::Error::other("x")).status_code(), 500);
        assert_eq!(CgiError::ExitFailure(1).status_code(), 500);
    }
}
