use std::os::fd::RawFd;
use std::time::Instant;

use super::{Connection, Outcome, Ready, Respond};
use crate::pool::Pool;
use crate::request::Parse;
use crate::sys::{MappedRegion, Sys};
use crate::timeout::TimerQueue;
use crate::Config;


/// The identifier of a [`Connection`] within [`Connections`].
///
/// Identifiers are reused once their connection is removed. The
/// [`TimerQueue`] never hands out a stale one: closing a connection clears
/// its timeout payload first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u32);

impl ConnId {
    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("connection index exceeds u32::MAX"))
    }

    /// Returns the slot index of this identifier.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}


/// The table of all open connections.
///
/// [`Connections`] owns every [`Connection`] from accept to removal, so the
/// storage of a closed connection is freed here rather than by
/// `Connection::close`. The [`Pool`]s of removed connections are kept and
/// handed to the next accepted connection.
#[derive(Debug)]
pub struct Connections<M = MappedRegion> {
    config: Config,
    slots: Vec<Option<Connection<M>>>,
    free: Vec<ConnId>,
    pools: Vec<Pool>,
    live: usize,
}

impl<M> Connections<M> {
    /// Creates an empty table for connections configured by `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, slots: Vec::new(), free: Vec::new(), pools: Vec::new(), live: 0 }
    }

    /// Returns the shared configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of open connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Tests whether no connections are open.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the number of pools waiting for reuse.
    #[inline]
    #[must_use]
    pub fn spare_pools(&self) -> usize {
        self.pools.len()
    }

    /// Registers the freshly accepted socket `fd` and installs
    /// [`Phase::ReadRequest`](super::Phase::ReadRequest).
    ///
    /// Returns [`None`] if `Config::max_conns` connections are already
    /// open. The socket is left untouched in that case and must be closed
    /// by the caller.
    pub fn insert(&mut self, fd: RawFd, epfd: RawFd) -> Option<ConnId> {
        if self.live >= self.config.max_conns.get() as usize {
            tracing::warn!(fd, open = self.live, "connection limit reached");
            return None;
        }

        let pool = self.pools.pop().unwrap_or_else(|| Pool::new(self.config.pool_size));
        let mut conn = Connection::with_pool(fd, epfd, &self.config, pool);
        conn.set_phase(super::Phase::ReadRequest);

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id.index()] = Some(conn);
                id
            },
            None => {
                self.slots.push(Some(conn));
                ConnId::from_index(self.slots.len() - 1)
            },
        };
        self.live += 1;
        Some(id)
    }

    /// Returns the connection registered as `id`.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&Connection<M>> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Mutable variant of `Connections::get`.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<M>> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Removes the connection registered as `id` and hands it to the caller.
    ///
    /// Its pool is not recycled. The connection must already be closed, or
    /// the caller takes over closing it.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<M>> {
        let conn = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(conn)
    }

    /// Removes a closed connection and keeps its pool for the next accept.
    fn recycle(&mut self, id: ConnId) {
        if let Some(conn) = self.remove(id) {
            self.pools.push(conn.into_pool());
        }
    }

    /// Queues a timeout node for `id`, expiring after the configured idle
    /// time.
    ///
    /// Returns `false` if no connection is registered as `id`.
    pub fn arm_timer(&mut self, id: ConnId, timers: &mut TimerQueue, now: Instant) -> bool {
        let deadline = now + self.config.keep_alive;
        match self.get_mut(id) {
            Some(conn) => {
                conn.arm_timer(timers, deadline, id);
                true
            },
            None => false,
        }
    }

    /// Closes `id` and removes it from the table.
    pub fn close<S: Sys<Map = M>>(&mut self, id: ConnId, sys: &mut S, timers: &mut TimerQueue) {
        if let Some(conn) = self.get_mut(id) {
            conn.close(sys, timers);
            self.recycle(id);
        }
    }

    /// Closes and removes every connection whose idle deadline passed.
    ///
    /// Returns the number of connections closed.
    pub fn close_expired<S>(&mut self, now: Instant, sys: &mut S, timers: &mut TimerQueue) -> usize
    where
        S: Sys<Map = M>,
    {
        let expired = timers.expire(now);
        let mut closed = 0;
        for id in expired {
            if let Some(conn) = self.get_mut(id) {
                tracing::debug!(fd = conn.fd(), "idle connection timed out");
                conn.close(sys, timers);
                self.recycle(id);
                closed += 1;
            }
        }
        closed
    }
}

impl<M: AsRef<[u8]>> Connections<M> {
    /// Dispatches a readiness event to the connection registered as `id`.
    ///
    /// Closed connections are removed from the table. After every completed
    /// keep-alive request, the idle deadline is pushed back to `now` plus the
    /// configured idle time. Events for unknown identifiers report
    /// [`Outcome::Closed`].
    #[allow(clippy::too_many_arguments)]
    pub fn on_ready<S, P, R>(
        &mut self,
        id: ConnId,
        ready: Ready,
        sys: &mut S,
        timers: &mut TimerQueue,
        parser: &mut P,
        responder: &mut R,
        now: Instant,
    ) -> Outcome
    where
        S: Sys<Map = M>,
        P: Parse + ?Sized,
        R: Respond<S> + ?Sized,
    {
        let deadline = now + self.config.keep_alive;
        let Some(conn) = self.get_mut(id) else {
            tracing::debug!(?id, "readiness event for unknown connection");
            return Outcome::Closed;
        };

        let served = conn.served();
        match conn.on_ready(ready, sys, timers, parser, responder) {
            Outcome::Closed => {
                self.recycle(id);
                Outcome::Closed
            },
            Outcome::Pending => {
                if conn.served() != served {
                    conn.arm_timer(timers, deadline, id);
                }
                Outcome::Pending
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{init_tracing, FakeMap, LineParser, ReadStep, Recorder};
    use crate::{Phase, Request, ResponseBuilder};

    struct NotFound;

    impl Respond<Recorder> for NotFound {
        fn respond(&mut self, _: &Request, _: &[u8], res: &mut ResponseBuilder<'_, Recorder>) -> std::io::Result<()> {
            res.status(404).body(b"not found")?;
            Ok(())
        }
    }

    fn table(max: u32) -> Connections<FakeMap> {
        Connections::new(Config::with_conns(NonZeroU32::new(max).unwrap()))
    }

    #[test]
    fn trait_check() {
        fn ok<T: Send + Unpin>() {}
        ok::<Connections<FakeMap>>();
    }

    #[test]
    fn insert_and_limit() {
        init_tracing();
        let mut conns = table(2);
        let a = conns.insert(10, 3).unwrap();
        let b = conns.insert(11, 3).unwrap();
        assert_ne!(a, b);
        assert!(conns.insert(12, 3).is_none());
        assert_eq!(conns.len(), 2);
        assert_eq!(conns.get(a).unwrap().fd(), 10);
        assert_eq!(conns.get(b).unwrap().phase(), Phase::ReadRequest);

        let removed = conns.remove(a).unwrap();
        assert_eq!(removed.fd(), 10);
        assert!(conns.get(a).is_none());
        assert!(conns.remove(a).is_none());

        // The slot is reused
        let c = conns.insert(12, 3).unwrap();
        assert_eq!(c, a);
        assert_eq!(conns.get(c).unwrap().fd(), 12);
    }

    #[test]
    fn pools_are_recycled() {
        init_tracing();
        let mut sys = Recorder::default();
        let mut timers = TimerQueue::new();
        let mut conns = table(8);
        let a = conns.insert(10, 3).unwrap();
        assert!(conns.arm_timer(a, &mut timers, Instant::now()));
        assert_eq!(conns.spare_pools(), 0);

        conns.close(a, &mut sys, &mut timers);
        assert_eq!(sys.closed, vec![10]);
        assert!(conns.is_empty());
        assert_eq!(conns.spare_pools(), 1);

        let b = conns.insert(11, 3).unwrap();
        assert_eq!(conns.spare_pools(), 0);
        assert_eq!(conns.get(b).unwrap().pool().used(), 0);
    }

    #[test]
    fn idle_timeouts() {
        init_tracing();
        let mut sys = Recorder::default();
        let mut timers = TimerQueue::new();
        let mut conns = table(8);
        let now = Instant::now();
        let keep_alive = conns.config().keep_alive;

        let idle = conns.insert(10, 3).unwrap();
        let busy = conns.insert(11, 3).unwrap();
        let gone = conns.insert(12, 3).unwrap();
        for id in [idle, busy, gone] {
            assert!(conns.arm_timer(id, &mut timers, now));
        }
        conns.close(gone, &mut sys, &mut timers);
        assert_eq!(timers.len(), 3);

        // The busy connection completes a request half-way to its deadline
        sys.push_read(ReadStep::Data(b"GET /x HTTP/1.1\r\n\r\n".to_vec()));
        let later = now + keep_alive / 2;
        let outcome = conns.on_ready(busy, Ready::READABLE, &mut sys, &mut timers, &mut LineParser, &mut NotFound, later);
        assert_eq!(outcome, Outcome::Pending);
        assert!(sys.written.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert!(sys.written.ends_with(b"not found"));

        assert_eq!(conns.close_expired(now + keep_alive, &mut sys, &mut timers), 1);
        assert_eq!(sys.closed, vec![12, 10]);
        assert!(conns.get(idle).is_none());
        assert!(conns.get(busy).is_some());

        assert_eq!(conns.close_expired(later + keep_alive, &mut sys, &mut timers), 1);
        assert_eq!(sys.closed, vec![12, 10, 11]);
        assert!(conns.is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn closed_on_ready_is_removed() {
        init_tracing();
        let mut sys = Recorder::with_input([b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n".to_vec()]);
        let mut timers = TimerQueue::new();
        let mut conns = table(8);
        let id = conns.insert(10, 3).unwrap();
        assert!(conns.arm_timer(id, &mut timers, Instant::now()));

        let outcome = conns.on_ready(id, Ready::READABLE, &mut sys, &mut timers, &mut LineParser, &mut NotFound, Instant::now());
        assert_eq!(outcome, Outcome::Closed);
        assert!(conns.is_empty());
        assert_eq!(conns.spare_pools(), 1);

        // Later events for the same identifier are harmless
        let outcome = conns.on_ready(id, Ready::READABLE, &mut sys, &mut timers, &mut LineParser, &mut NotFound, Instant::now());
        assert_eq!(outcome, Outcome::Closed);
        assert_eq!(sys.closed, vec![10]);
        assert_eq!(conns.close_expired(Instant::now() + Duration::from_secs(3600), &mut sys, &mut timers), 0);
    }
}
