//! UDP socket helpers: bind, unbound client sockets, multicast membership.

use super::{cvt, cvt_fd, close, set_reuseaddr, sockaddr_in};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

/// Creates a UDP socket bound to `(local_ip, udp_port)`. `SO_REUSEADDR=1`.
pub fn create_bound_socket(local_ip: Ipv4Addr, udp_port: u16) -> io::Result<RawFd> {
    let fd = unsafe { cvt_fd(libc::socket(libc::PF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP))? };
    if let Err(e) = (|| -> io::Result<()> {
        set_reuseaddr(fd, true)?;
        let addr = sockaddr_in(u32::from(local_ip).to_be(), udp_port);
        unsafe {
            cvt(libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ))?;
        }
        Ok(())
    })() {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Creates a plain (unbound) UDP client socket, generally used to send to
/// an arbitrary peer.
pub fn create_client_socket() -> io::Result<RawFd> {
    unsafe { cvt_fd(libc::socket(libc::PF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP)) }
}

fn ip_mreq(local_ip: Ipv4Addr, multicast_ip: Ipv4Addr) -> libc::ip_mreq {
    libc::ip_mreq {
        imr_multiaddr: libc::in_addr { s_addr: u32::from(multicast_ip).to_be() },
        imr_interface: libc::in_addr { s_addr: u32::from(local_ip).to_be() },
    }
}

/// `IP_ADD_MEMBERSHIP` on `IPPROTO_IP`.
pub fn join_multicast_group(udp_sock_fd: RawFd, local_ip: Ipv4Addr, multicast_ip: Ipv4Addr) -> io::Result<()> {
    let req = ip_mreq(local_ip, multicast_ip);
    unsafe {
        cvt(libc::setsockopt(
            udp_sock_fd,
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &req as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        ))?;
    }
    Ok(())
}

/// `IP_DROP_MEMBERSHIP` on `IPPROTO_IP`.
pub fn leave_multicast_group(udp_sock_fd: RawFd, local_ip: Ipv4Addr, multicast_ip: Ipv4Addr) -> io::Result<()> {
    let req = ip_mreq(local_ip, multicast_ip);
    unsafe {
        cvt(libc::setsockopt(
            udp_sock_fd,
            libc::IPPROTO_IP,
            libc::IP_DROP_MEMBERSHIP,
            &req as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        ))?;
    }
    Ok(())
}
