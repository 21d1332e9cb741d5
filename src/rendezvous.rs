use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use anyhow::{Context, Result, bail};
use rustix::net::{
    AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, SocketFlags, SocketType, recvmsg, send, sendmsg, socketpair,
};

pub fn pair() -> Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::UNIX,
        SocketType::SEQPACKET,
        SocketFlags::CLOEXEC,
        None,
    )
    .context("Unable to create socketpair")
}

pub fn wake(sock: impl AsFd) -> Result<()> {
    send(sock.as_fd(), &[0u8], SendFlags::empty()).context("Failed to write rendezvous byte")?;
    Ok(())
}

// A short read (peer closed without writing) is treated as fatal.
pub fn wait(sock: impl AsFd, context: &'static str) -> Result<()> {
    let mut buf = [0u8; 1];
    let n = rustix::net::recv(sock.as_fd(), &mut buf, RecvFlags::empty())
        .with_context(|| context)?;
    if n != 1 {
        bail!("{context}: short read on rendezvous socket");
    }
    Ok(())
}

// seqpacket sockets need some regular data alongside the ancillary message.
pub fn send_fd(sock: impl AsFd, fd: impl AsFd) -> Result<()> {
    let fds = [fd.as_fd()];
    let message = SendAncillaryMessage::ScmRights(&fds);
    let mut space = [std::mem::MaybeUninit::uninit(); 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    let pushed = ancillary.push(message);
    debug_assert!(pushed);

    let iov = [std::io::IoSlice::new(&[0u8])];
    sendmsg(sock.as_fd(), &iov, &mut ancillary, SendFlags::empty())
        .context("Failed to send fd over socket")?;
    Ok(())
}

pub fn recv_fd(sock: impl AsFd) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut payload)];
    let mut space = [std::mem::MaybeUninit::uninit(); 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);

    recvmsg(
        sock.as_fd(),
        &mut iov,
        &mut ancillary,
        RecvFlags::empty(),
    )
    .context("Failed to receive fd over socket")?;

    for message in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(mut fds) = message {
            if let Some(fd) = fds.next() {
                return Ok(fd);
            }
        }
    }

    bail!("No fd received on socket")
}

#[allow(dead_code)]
pub fn assert_cloexec(fd: BorrowedFd<'_>) {
    use rustix::io::fcntl_getfd;
    debug_assert!(
        fcntl_getfd(fd)
            .map(|flags| flags.contains(rustix::io::FdFlags::CLOEXEC))
            .unwrap_or(true)
    );
}
