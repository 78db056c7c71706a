use std::{
    io::{Read, Write},
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::net::UnixStream,
    time::Duration,
};

use anyhow::Result;
use codec::{
    Command,
    message::{
        AuthCookieReq, AuthRc, ResumeFetch, ResumeFetchRep, ReplyStatus, SecAuthInit,
        SecAuthReply, Sid,
    },
};
use vpn_server::{
    ipc::{self, IpcError},
    worker::{WorkerChannel, WorkerEvent},
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn inode(fd: RawFd) -> (u64, u64) {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
    (st.st_dev as u64, st.st_ino as u64)
}

#[test]
fn frame_round_trip() -> Result<()> {
    let (a, b) = UnixStream::pair()?;

    let msg = AuthCookieReq { sid: Sid([9u8; 16]) };
    ipc::send_msg(&a, Command::AuthCookieReq, Some(&msg), None)?;

    let (received, fd) = ipc::recv_msg::<AuthCookieReq>(&b, Command::AuthCookieReq, TIMEOUT)?;
    assert_eq!(received, msg);
    assert!(fd.is_none());

    Ok(())
}

#[test]
fn empty_frames_have_no_body() -> Result<()> {
    let (a, b) = UnixStream::pair()?;

    ipc::send_empty(&a, Command::Terminate)?;

    let (cmd, body, fd) = ipc::recv_msg_data(&b, TIMEOUT)?;
    assert_eq!(cmd, Command::Terminate);
    assert!(body.is_empty());
    assert!(fd.is_none());

    Ok(())
}

#[test]
fn descriptor_passing_shares_the_kernel_object() -> Result<()> {
    let (a, b) = UnixStream::pair()?;
    let (reader, writer) = pipe();

    let msg = AuthCookieReq { sid: Sid([1u8; 16]) };
    ipc::send_msg(&a, Command::AuthCookieReq, Some(&msg), Some(writer.as_fd()))?;

    let (_, passed) = ipc::recv_msg::<AuthCookieReq>(&b, Command::AuthCookieReq, TIMEOUT)?;
    let passed = passed.expect("a descriptor was sent");

    // Same kernel object, different descriptor number is fine.
    assert_eq!(inode(passed.as_raw_fd()), inode(writer.as_raw_fd()));

    // Close the sender's copy; the received one must still reach the
    // pipe's read end.
    drop(writer);

    let mut received_file = std::fs::File::from(passed);
    received_file.write_all(b"through the passed fd")?;
    drop(received_file);

    let mut buf = String::new();
    std::fs::File::from(reader).read_to_string(&mut buf)?;
    assert_eq!(buf, "through the passed fd");

    Ok(())
}

#[test]
fn receive_times_out_without_data() -> Result<()> {
    let (_a, b) = UnixStream::pair()?;

    let start = std::time::Instant::now();
    let result = ipc::recv_msg_data(&b, Duration::from_millis(100));

    assert!(matches!(result, Err(IpcError::TimedOut)));
    assert!(start.elapsed() >= Duration::from_millis(100));

    Ok(())
}

#[test]
fn closed_peer_is_detected() -> Result<()> {
    let (a, b) = UnixStream::pair()?;

    drop(a);
    assert!(matches!(
        ipc::recv_msg_data(&b, TIMEOUT),
        Err(IpcError::PeerTerminated)
    ));

    Ok(())
}

#[test]
fn unexpected_command_is_fatal() -> Result<()> {
    let (a, b) = UnixStream::pair()?;

    ipc::send_empty(&a, Command::Terminate)?;
    assert!(matches!(
        ipc::recv_msg::<()>(&b, Command::SecmReload, TIMEOUT),
        Err(IpcError::BadCommand)
    ));

    Ok(())
}

#[test]
fn unknown_command_bytes_are_rejected() -> Result<()> {
    let (mut a, b) = UnixStream::pair()?;

    a.write_all(&[0xfe, 0, 0, 0, 0])?;
    assert!(matches!(
        ipc::recv_msg_data(&b, TIMEOUT),
        Err(IpcError::BadCommand)
    ));

    Ok(())
}

#[test]
fn oversize_bodies_are_rejected() -> Result<()> {
    let (mut a, b) = UnixStream::pair()?;

    // Terminate with a body length far past the cap.
    let mut header = vec![u8::from(Command::Terminate)];
    header.extend_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());
    a.write_all(&header)?;

    assert!(matches!(
        ipc::recv_msg_data(&b, TIMEOUT),
        Err(IpcError::BadCommand)
    ));

    Ok(())
}

#[test]
fn worker_channel_round_trips() -> Result<()> {
    let (worker_sock, supervisor_sock) = UnixStream::pair()?;
    let channel = WorkerChannel::new(worker_sock, TIMEOUT);

    // A mock supervisor answers one auth init, one ticket fetch, then
    // terminates the worker.
    let supervisor = std::thread::spawn(move || -> Result<()> {
        let (init, _) =
            ipc::recv_msg::<SecAuthInit>(&supervisor_sock, Command::SecAuthInit, TIMEOUT)?;
        assert_eq!(init.username, "alice");

        let reply = SecAuthReply {
            rc: AuthRc::Continue,
            sid: Some(Sid([3u8; 16])),
            msg: Some("Please enter your password.".to_string()),
        };
        ipc::send_msg(&supervisor_sock, Command::SecAuthReply, Some(&reply), None)?;

        let (fetch, _) =
            ipc::recv_msg::<ResumeFetch>(&supervisor_sock, Command::ResumeFetchReq, TIMEOUT)?;
        assert_eq!(fetch.session_id, b"ticket-key");

        let reply = ResumeFetchRep {
            status: ReplyStatus::Failed,
            data: Vec::new(),
        };
        ipc::send_msg(&supervisor_sock, Command::ResumeFetchRep, Some(&reply), None)?;

        ipc::send_empty(&supervisor_sock, Command::Terminate)?;
        Ok(())
    });

    let reply = channel.auth_init(&SecAuthInit {
        vhost: String::new(),
        username: "alice".to_string(),
        remote_ip: "192.0.2.1".to_string(),
        user_agent: "client".to_string(),
        worker_pid: 7,
    })?;
    assert_eq!(reply.rc, AuthRc::Continue);
    assert!(reply.sid.is_some());

    assert_eq!(channel.resume_fetch(b"ticket-key")?, None);

    assert!(matches!(
        channel.poll_command(TIMEOUT)?,
        WorkerEvent::Terminate
    ));

    supervisor.join().unwrap()?;

    Ok(())
}

#[test]
fn forward_rewrites_the_command_byte() -> Result<()> {
    let (worker, main_in) = UnixStream::pair()?;
    let (main_out, secmod) = UnixStream::pair()?;

    let msg = SecAuthInit {
        vhost: "default".to_string(),
        username: "alice".to_string(),
        remote_ip: "192.0.2.1".to_string(),
        user_agent: "test agent".to_string(),
        worker_pid: 42,
    };

    // The worker's auth step travels through the relay unchanged except
    // for the command byte.
    ipc::send_msg(&worker, Command::SecAuthInit, Some(&msg), None)?;
    ipc::forward_msg(
        &main_in,
        Command::SecAuthInit,
        &main_out,
        Command::SecAuthInit,
        TIMEOUT,
    )?;

    let (received, _) = ipc::recv_msg::<SecAuthInit>(&secmod, Command::SecAuthInit, TIMEOUT)?;
    assert_eq!(received, msg);

    // A mismatched inbound command aborts the relay.
    ipc::send_empty(&worker, Command::Terminate)?;
    assert!(matches!(
        ipc::forward_msg(
            &main_in,
            Command::SecAuthInit,
            &main_out,
            Command::SecAuthInit,
            TIMEOUT,
        ),
        Err(IpcError::BadCommand)
    ));

    Ok(())
}
