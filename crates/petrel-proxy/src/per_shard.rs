// Per-shard aggregation root: owns the multiplexer and the live downstream
// sessions on this shard, and watches the router for host changes.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use petrel_common::HostId;
use petrel_io::{LoopCtx, TimerHandle};
use petrel_router::ShardId;

use crate::multiplexer::Multiplexer;
use crate::per_stream::PerStream;
use crate::ProxyEnv;

pub(crate) struct PerShard {
    pub(crate) ctx: LoopCtx,
    pub(crate) env: std::sync::Arc<ProxyEnv>,
    pub(crate) shard: ShardId,
    pub(crate) mux: Multiplexer,
    state: RefCell<ShardState>,
    _route_timer: TimerHandle,
}

struct ShardState {
    host: Option<HostId>,
    router_version: u64,
    sessions: HashMap<u64, Rc<PerStream>>,
}

impl PerShard {
    pub(crate) fn new(ctx: &LoopCtx, env: std::sync::Arc<ProxyEnv>, shard: ShardId) -> Rc<PerShard> {
        let host = env.sharding.get_host(shard);
        if host.is_none() {
            tracing::warn!(shard, "shard has no host yet");
        }
        let mux = Multiplexer::new(ctx, host.clone(), env.accumulator_bytes);
        Rc::new_cyclic(|weak: &std::rc::Weak<PerShard>| {
            let poll_weak = weak.clone();
            let route_timer = ctx.register_timer(env.router_poll_period, move |_ctx| {
                if let Some(shard) = poll_weak.upgrade() {
                    shard.poll_router();
                }
            });
            PerShard {
                ctx: ctx.clone(),
                env,
                shard,
                mux,
                state: RefCell::new(ShardState {
                    host,
                    router_version: 0,
                    sessions: HashMap::new(),
                }),
                _route_timer: route_timer,
            }
        })
    }

    pub(crate) fn host(&self) -> Option<HostId> {
        self.state.borrow().host.clone()
    }

    pub(crate) fn register_session(&self, stream_id: u64, session: Rc<PerStream>) {
        self.state.borrow_mut().sessions.insert(stream_id, session);
    }

    pub(crate) fn remove_session(&self, stream_id: u64) {
        self.state.borrow_mut().sessions.remove(&stream_id);
    }

    /// Check the strategy version; on a host change, tear down the
    /// stream-level sessions first, then reroute the aggregated
    /// subscriptions.
    fn poll_router(self: &Rc<Self>) {
        let version = self.env.sharding.version();
        {
            let state = self.state.borrow();
            if version == state.router_version && state.host.is_some() {
                return;
            }
        }
        let new_host = self.env.sharding.get_host(self.shard);
        let (changed, sessions) = {
            let mut state = self.state.borrow_mut();
            state.router_version = version;
            if state.host == new_host {
                return;
            }
            tracing::info!(
                shard = self.shard,
                old = ?state.host,
                new = ?new_host,
                "shard route changed"
            );
            state.host = new_host.clone();
            let sessions: Vec<Rc<PerStream>> = state.sessions.values().cloned().collect();
            (true, sessions)
        };
        if !changed {
            return;
        }
        for session in sessions {
            session.change_route();
        }
        if let Some(host) = new_host {
            self.mux.change_route(host);
        }
    }
}

impl Drop for PerShard {
    fn drop(&mut self) {
        self.mux.close();
    }
}
