//! Multicast bus + mesh transports, the `(path, handler)` dispatch table,
//! and outbound bundling (spec §4.1; handler table per [ADD 4.1.1],
//! grounded on `original_source/src/network.c`'s path `switch` and the
//! teacher's `(path, type-spec, fn)` framing from its design notes).

use mapper_core::time::MapperTime;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Bind and join the discovery multicast group, non-blocking. `iface` (if
/// given) selects the outbound interface; `None` lets the OS pick one
/// (spec §6.3 "network interface: auto").
pub fn bind_bus(group: Ipv4Addr, port: u16, iface: Option<Ipv4Addr>) -> std::io::Result<UdpSocket> {
    let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    sock.join_multicast_v4(&group, &iface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
    sock.set_multicast_ttl_v4(1)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Bind a unicast mesh/data socket on an OS-assigned port, non-blocking.
pub fn bind_unicast() -> std::io::Result<UdpSocket> {
    let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// One non-blocking receive attempt; `None` on `WouldBlock` or a
/// malformed packet (dropped per spec §7 `ProtocolParse`: recovered
/// locally).
pub fn recv_noblock(sock: &UdpSocket) -> Option<(OscPacket, SocketAddr)> {
    let mut buf = [0u8; 65536];
    match sock.recv_from(&mut buf) {
        Ok((n, from)) => rosc::decoder::decode_udp(&buf[..n]).ok().map(|(_, pkt)| (pkt, from)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
        Err(_) => None,
    }
}

pub fn send_message(sock: &UdpSocket, addr: SocketAddr, msg: OscMessage) -> std::io::Result<()> {
    let bytes = rosc::encoder::encode(&OscPacket::Message(msg))
        .map_err(|e| std::io::Error::other(format!("{e:?}")))?;
    sock.send_to(&bytes, addr)?;
    Ok(())
}

pub fn send_bundle(
    sock: &UdpSocket,
    addr: SocketAddr,
    timestamp: MapperTime,
    messages: Vec<OscMessage>,
) -> std::io::Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let bundle = OscBundle {
        timetag: OscTime::try_from((timestamp.sec as u32, timestamp.frac as u32)).unwrap_or(OscTime::from((0u32, 0u32))),
        content: messages.into_iter().map(OscPacket::Message).collect(),
    };
    let bytes =
        rosc::encoder::encode(&OscPacket::Bundle(bundle)).map_err(|e| std::io::Error::other(format!("{e:?}")))?;
    sock.send_to(&bytes, addr)?;
    Ok(())
}

/// `(path, handler)` dispatch table (spec [ADD 4.1.1]). Generic over the
/// caller's context type rather than hardcoding `Graph`, since a device's
/// handlers need the device's own state (router, signals) as well as the
/// graph.
pub struct HandlerTable<Ctx> {
    handlers: HashMap<&'static str, Box<dyn Fn(&mut Ctx, &OscMessage, SocketAddr)>>,
}

impl<Ctx> Default for HandlerTable<Ctx> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<Ctx> HandlerTable<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &'static str, f: impl Fn(&mut Ctx, &OscMessage, SocketAddr) + 'static) {
        self.handlers.insert(path, Box::new(f));
    }

    /// Exact-path dispatch; dynamic per-signal data paths (`/<dev>/<sig>`)
    /// are matched by the caller before falling back here, since they are
    /// not known at table-build time.
    pub fn dispatch(&self, ctx: &mut Ctx, msg: &OscMessage, from: SocketAddr) -> bool {
        if let Some(h) = self.handlers.get(msg.addr.as_str()) {
            h(ctx, msg, from);
            true
        } else {
            false
        }
    }
}

/// Housekeeping tick cadence (spec §4.10): `/sync` every `sync_interval`,
/// `/ping` every `ping_interval` (jittered by the caller), subscriber/link
/// TTL sweeps on every tick.
pub struct Ticker {
    pub sync_interval: Duration,
    pub ping_interval: Duration,
    last_sync: MapperTime,
    last_ping: MapperTime,
}

impl Ticker {
    pub fn new(sync_interval: Duration, ping_interval: Duration) -> Self {
        Self {
            sync_interval,
            ping_interval,
            last_sync: MapperTime::ZERO,
            last_ping: MapperTime::ZERO,
        }
    }

    pub fn sync_due(&mut self, now: MapperTime) -> bool {
        if now.diff(&self.last_sync) >= self.sync_interval.as_secs_f64() {
            self.last_sync = now;
            true
        } else {
            false
        }
    }

    pub fn ping_due(&mut self, now: MapperTime) -> bool {
        if now.diff(&self.last_ping) >= self.ping_interval.as_secs_f64() {
            self.last_ping = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_table_dispatches_exact_path() {
        let mut table: HandlerTable<i32> = HandlerTable::new();
        table.insert("/ping", |ctx, _msg, _from| *ctx += 1);
        let msg = OscMessage { addr: "/ping".to_string(), args: vec![] };
        let mut ctx = 0;
        let from: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(table.dispatch(&mut ctx, &msg, from));
        assert_eq!(ctx, 1);
    }

    #[test]
    fn handler_table_unknown_path_returns_false() {
        let table: HandlerTable<i32> = HandlerTable::new();
        let msg = OscMessage { addr: "/nope".to_string(), args: vec![] };
        let mut ctx = 0;
        let from: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(!table.dispatch(&mut ctx, &msg, from));
    }

    #[test]
    fn ticker_fires_once_per_interval() {
        let mut t = Ticker::new(Duration::from_secs(2), Duration::from_secs(5));
        assert!(t.sync_due(MapperTime::from_double(0.0)));
        assert!(!t.sync_due(MapperTime::from_double(1.0)));
        assert!(t.sync_due(MapperTime::from_double(2.5)));
    }
}
