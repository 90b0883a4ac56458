//! Payload argument block
//!
//! Payload entry points receive, in rdi, a pointer to a block giving them a
//! kernel read/write primitive and a way back to the loader:
//!
//! | offset | value                                             |
//! |--------|---------------------------------------------------|
//! | 0x00   | address of the syscall-stub routine (getpid)      |
//! | 0x08   | pointer to `{pipe read fd, pipe write fd}`        |
//! | 0x10   | pointer to `{master socket, victim socket}`       |
//! | 0x18   | kernel address of the pipe's file                 |
//! | 0x20   | kernel data base                                  |
//! | 0x28   | pointer to the payload's int output cell          |
//!
//! The block and the arrays it points at share one page that stays mapped.

use std::io;

use hbldr_bridge::syscalls::{
    AF_INET6, IPPROTO_IPV6, IPPROTO_UDP, IPV6_2292PKTOPTIONS, IPV6_PKTINFO, IPV6_TCLASS, SOCK_DGRAM,
};
use hbldr_bridge::{nid, TracedProcess};
use hbldr_common::{create_logger, log_detail, Error, Result, PAGE_SIZE};

const RWPIPE: u64 = 0x100;
const RWPAIR: u64 = 0x200;
const PAYLOAD_OUT: u64 = 0x300;

/// Descriptors and addresses handed to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadArgs {
    /// Address of the block inside the target
    pub address: u64,
    pub pipe: [i32; 2],
    pub sockets: [i32; 2],
    pub pipe_file: u64,
}

fn ints(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Create the sockets and pipe and write the block.
pub fn build(process: &mut TracedProcess<'_>) -> Result<PayloadArgs> {
    let pid = process.pid();
    let kernel = process.bridge().kernel();
    let page = process.alloc_scratch(PAGE_SIZE)?;

    let master = process.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP)?;
    // struct cmsghdr { len 20, level, type } followed by a zero tclass
    process.write_bytes(page, &ints(&[20, IPPROTO_IPV6, IPV6_TCLASS, 0, 0, 0]))?;
    process.setsockopt(master, IPPROTO_IPV6, IPV6_2292PKTOPTIONS, page, 24)?;

    let victim = process.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP)?;
    process.write_bytes(page, &[0u8; 20])?;
    process.setsockopt(victim, IPPROTO_IPV6, IPV6_PKTINFO, page, 20)?;

    kernel
        .overlap_sockets(pid, master, victim)
        .map_err(|source| Error::Privilege { pid, op: "overlap sockets", source })?;

    process.pipe(page)?;
    let pipe = [process.read_u32(page)? as i32, process.read_u32(page + 4)? as i32];
    let pipe_file = kernel.file_address(pid, pipe[0]).ok_or_else(|| Error::Privilege {
        pid,
        op: "pipe file address",
        source: io::Error::from_raw_os_error(libc::ENOENT),
    })?;
    let getpid = process.resolve(nid::GETPID)?;

    let mut block = vec![0u8; PAYLOAD_OUT as usize + 4];
    let header = [getpid, page + RWPIPE, page + RWPAIR, pipe_file, kernel.data_base(), page + PAYLOAD_OUT];
    for (i, value) in header.iter().enumerate() {
        block[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }
    block[RWPIPE as usize..RWPIPE as usize + 8].copy_from_slice(&ints(&pipe));
    block[RWPAIR as usize..RWPAIR as usize + 8].copy_from_slice(&ints(&[master, victim]));
    process.write_bytes(page, &block)?;

    log_detail!(
        create_logger("elfldr"),
        "pid {}: payload args at {:#x} pipe {:?} sockets {}/{}",
        pid,
        page,
        pipe,
        master,
        victim
    );
    Ok(PayloadArgs { address: page, pipe, sockets: [master, victim], pipe_file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbldr_bridge::testing::{Event, FakeTarget, FdKind, FAKE_PID, KERNEL_DATA_BASE};
    use hbldr_bridge::{Bridge, Kernel};
    use hbldr_common::BridgeConfig;

    #[test]
    fn test_block_layout() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();

        let args = build(&mut process).unwrap();
        let at = |off: u64| fake.peek_u64(FAKE_PID, args.address + off);
        assert_eq!(at(0x00), fake.symbol(nid::GETPID));
        assert_eq!(at(0x08), args.address + RWPIPE);
        assert_eq!(at(0x10), args.address + RWPAIR);
        assert_eq!(at(0x18), fake.file_address(FAKE_PID, args.pipe[0]).unwrap());
        assert_eq!(at(0x20), KERNEL_DATA_BASE);
        assert_eq!(at(0x28), args.address + PAYLOAD_OUT);

        assert_eq!(fake.peek(FAKE_PID, args.address + RWPIPE, 8), ints(&args.pipe));
        assert_eq!(fake.peek(FAKE_PID, args.address + RWPAIR, 8), ints(&args.sockets));
        assert_eq!(fake.peek(FAKE_PID, args.address + PAYLOAD_OUT, 4), vec![0; 4]);
        assert_eq!(fake.descriptor(FAKE_PID, args.pipe[0]), Some(FdKind::Pipe));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_sockets_prepared_and_overlapped() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();

        let args = build(&mut process).unwrap();
        let [master, victim] = args.sockets;
        assert_eq!(fake.descriptor(FAKE_PID, master), Some(FdKind::Socket { domain: AF_INET6 }));
        assert!(fake.events().contains(&Event::OverlapSockets(FAKE_PID, master, victim)));

        let options = fake.socket_options(FAKE_PID);
        assert_eq!(options.len(), 2);
        assert_eq!(
            options[0],
            (master, IPPROTO_IPV6, IPV6_2292PKTOPTIONS, ints(&[20, IPPROTO_IPV6, IPV6_TCLASS, 0, 0, 0]))
        );
        assert_eq!(options[1], (victim, IPPROTO_IPV6, IPV6_PKTINFO, vec![0; 20]));
        process.detach(0).unwrap();
    }
}
