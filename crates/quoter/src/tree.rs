use crate::accounting::{BillSink, NullBillSink, RateAccounting};
use crate::config::{canonize_path, parent_path, AccountingConfig, ResourceConfig};
use crate::queue::{ProcessorId, TickProcessorQueue, TickTask};
use crate::Error;
use proto_tablet::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;

pub type ClientId = u64;

pub const TICKS_PER_SECOND: f64 = 10.0;
pub const TICK: std::time::Duration = std::time::Duration::from_millis(100);
const TICK_US: u64 = 100_000;
const RESOURCE_BURST_COEFFICIENT: f64 = 0.0;
const EPSILON_COEFFICIENT: f64 = 1e-6;
const ULPS_ACCURACY: i64 = 4;

/// The first tick boundary strictly after `now_us`.
pub fn next_tick(now_us: u64) -> u64 {
    now_us - now_us % TICK_US + TICK_US
}

// Doubles equality with both an absolute epsilon and a ULPS bound, needed
// when a long chain of subtractions must settle at "exactly full".
fn almost_equal(a: f64, b: f64, max_diff: f64) -> bool {
    if (a - b).abs() <= max_diff {
        return true;
    }
    if a.is_sign_negative() != b.is_sign_negative() {
        return false;
    }
    let ia = a.to_bits() as i64;
    let ib = b.to_bits() as i64;
    (ia - ib).abs() <= ULPS_ACCURACY
}

/// Output of the tree, drained by the owner after each entry point.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Allocated {
        client: ClientId,
        resource_id: u64,
        amount: f64,
        /// Present when effective properties changed since the last send.
        effective: Option<ResourceConfig>,
    },
    Closed { client: ClientId, resource_id: u64, status: StatusCode, reason: String },
}

struct Node {
    parent: Option<usize>,
    weight: u32,
    active: bool,
    free_resource: f64,
    // Intrusive round-robin ring over the parent's active children.
    // Self-linked while detached.
    ring_prev: usize,
    ring_next: usize,
    body: NodeBody,
}

enum NodeBody {
    Resource(ResourceBody),
    Session(SessionBody),
}

struct ResourceBody {
    id: u64,
    path: String,
    props: ResourceConfig,
    // Effective parameters, recomputed top-down on any props change.
    max_units_per_second: f64,
    prefetch_coefficient: f64,
    prefetch_watermark: f64,
    tick_quantum: f64,
    filling_epsilon: f64,
    burst: f64,
    effective_accounting: AccountingConfig,
    children: Vec<usize>,
    session_clients: Vec<ClientId>,
    active_children_weight: u64,
    active_children_count: usize,
    current_active_child: Option<usize>,
    accounting: Option<RateAccounting>,
    active_accounting: bool,
    allocated_remainder: f64,
}

struct SessionBody {
    client: ClientId,
    resource_id: u64,
    amount_requested: f64,
    need_send_changed_props: bool,
    total_consumed: f64,
}

/// The quoter's resource tree: a single-owner structure driven by external
/// commands plus `run_until` ticks, emitting `SessionEvent`s.
pub struct QuoterTree {
    quoter_path: String,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    by_id: HashMap<u64, usize>,
    by_path: HashMap<String, usize>,
    sessions: HashMap<(ClientId, u64), usize>,
    next_resource_id: u64,
    queue: TickProcessorQueue,
    events: Vec<SessionEvent>,
    bill_sink: Arc<dyn BillSink>,
}

impl Default for QuoterTree {
    fn default() -> Self {
        Self::new("quoter", Arc::new(NullBillSink))
    }
}

impl QuoterTree {
    pub fn new(quoter_path: &str, bill_sink: Arc<dyn BillSink>) -> Self {
        Self {
            quoter_path: quoter_path.to_string(),
            nodes: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            sessions: HashMap::new(),
            next_resource_id: 1,
            queue: TickProcessorQueue::default(),
            events: Vec::new(),
            bill_sink,
        }
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest pending tick, if any.
    pub fn next_tick_at(&mut self) -> Option<u64> {
        self.queue.peek().map(|t| t.time)
    }

    // ---- arena plumbing ----

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            let fixed = Node { ring_prev: idx, ring_next: idx, ..node };
            self.nodes[idx] = Some(fixed);
            idx
        } else {
            let idx = self.nodes.len();
            let fixed = Node { ring_prev: idx, ring_next: idx, ..node };
            self.nodes.push(Some(fixed));
            idx
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live arena slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live arena slot")
    }

    fn res(&self, idx: usize) -> &ResourceBody {
        match &self.node(idx).body {
            NodeBody::Resource(body) => body,
            NodeBody::Session(_) => unreachable!("expected a resource node"),
        }
    }

    fn res_mut(&mut self, idx: usize) -> &mut ResourceBody {
        match &mut self.node_mut(idx).body {
            NodeBody::Resource(body) => body,
            NodeBody::Session(_) => unreachable!("expected a resource node"),
        }
    }

    fn session_body(&self, idx: usize) -> &SessionBody {
        match &self.node(idx).body {
            NodeBody::Session(body) => body,
            NodeBody::Resource(_) => unreachable!("expected a session node"),
        }
    }

    fn session_body_mut(&mut self, idx: usize) -> &mut SessionBody {
        match &mut self.node_mut(idx).body {
            NodeBody::Session(body) => body,
            NodeBody::Resource(_) => unreachable!("expected a session node"),
        }
    }

    // ---- ring operations (O(1) insert, remove, advance) ----

    fn ring_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.ring_prev, n.ring_next)
        };
        self.node_mut(prev).ring_next = next;
        self.node_mut(next).ring_prev = prev;
        let n = self.node_mut(idx);
        n.ring_prev = idx;
        n.ring_next = idx;
    }

    fn ring_insert_before(&mut self, at: usize, item: usize) {
        let at_prev = self.node(at).ring_prev;
        {
            let n = self.node_mut(item);
            n.ring_prev = at_prev;
            n.ring_next = at;
        }
        self.node_mut(at_prev).ring_next = item;
        self.node_mut(at).ring_prev = item;
    }

    // ---- resource management ----

    pub fn resource_id(&self, path: &str) -> Option<u64> {
        let canon = canonize_path(path).ok()?;
        self.by_path.get(&canon).map(|&idx| self.res(idx).id)
    }

    pub fn add_resource(&mut self, path: &str, props: ResourceConfig) -> Result<u64, Error> {
        let canon = canonize_path(path)?;
        if self.by_path.contains_key(&canon) {
            return Err(Error::ResourceAlreadyExists(canon));
        }
        let parent = match parent_path(&canon) {
            Some(parent) => Some(
                *self
                    .by_path
                    .get(parent)
                    .ok_or_else(|| Error::ParentNotFound(parent.to_string()))?,
            ),
            None => None,
        };
        props.validate(parent.is_none())?;

        let id = self.next_resource_id;
        self.next_resource_id += 1;

        let body = ResourceBody {
            id,
            path: canon.clone(),
            props,
            max_units_per_second: 0.0,
            prefetch_coefficient: 0.0,
            prefetch_watermark: 0.0,
            tick_quantum: 0.0,
            filling_epsilon: 0.0,
            burst: 0.0,
            effective_accounting: AccountingConfig::default(),
            children: Vec::new(),
            session_clients: Vec::new(),
            active_children_weight: 0,
            active_children_count: 0,
            current_active_child: None,
            accounting: None,
            active_accounting: false,
            allocated_remainder: 0.0,
        };
        let idx = self.alloc(Node {
            parent,
            weight: 1,
            active: false,
            free_resource: 0.0,
            ring_prev: 0,
            ring_next: 0,
            body: NodeBody::Resource(body),
        });
        if let Some(parent) = parent {
            self.res_mut(parent).children.push(idx);
        }
        self.by_path.insert(canon.clone(), idx);
        self.by_id.insert(id, idx);
        self.calc_parameters(idx);

        tracing::debug!(path = %canon, id, "added quoter resource");
        Ok(id)
    }

    pub fn update_resource(&mut self, path: &str, props: ResourceConfig) -> Result<(), Error> {
        let canon = canonize_path(path)?;
        let idx = *self.by_path.get(&canon).ok_or_else(|| Error::ResourceNotFound(canon.clone()))?;
        props.validate(self.node(idx).parent.is_none())?;
        self.res_mut(idx).props = props;
        self.calc_parameters(idx);
        self.on_props_changed(idx);
        Ok(())
    }

    pub fn delete_resource(&mut self, path: &str) -> Result<(), Error> {
        let canon = canonize_path(path)?;
        let idx = *self.by_path.get(&canon).ok_or_else(|| Error::ResourceNotFound(canon.clone()))?;
        if !self.res(idx).children.is_empty() {
            return Err(Error::HasChildren(canon));
        }

        let resource_id = self.res(idx).id;
        let reason = format!("resource {canon} was deleted");
        for client in self.res(idx).session_clients.clone() {
            self.close_session(client, resource_id, StatusCode::NotFound, &reason);
        }

        if self.node(idx).active {
            self.node_mut(idx).active = false;
            if let Some(parent) = self.node(idx).parent {
                self.remove_active_child(parent, idx);
            }
        }
        if let Some(parent) = self.node(idx).parent {
            self.res_mut(parent).children.retain(|&c| c != idx);
        }
        self.by_path.remove(&canon);
        self.by_id.remove(&resource_id);
        self.release(idx);
        Ok(())
    }

    // Recomputes effective parameters for `idx` and its whole subtree.
    fn calc_parameters(&mut self, idx: usize) {
        let parent = self.node(idx).parent;
        let parent_params = parent.map(|p| {
            let body = self.res(p);
            (
                body.max_units_per_second,
                body.prefetch_coefficient,
                body.prefetch_watermark,
                body.effective_accounting.clone(),
            )
        });

        let props = self.res(idx).props.clone();

        let mut rate = props.max_units_per_second.filter(|v| *v > 0.0).unwrap_or(0.0);
        if let Some((parent_rate, _, _, _)) = parent_params {
            if rate == 0.0 || rate > parent_rate {
                rate = parent_rate;
            }
        }

        let prefetch_coefficient = props
            .prefetch_coefficient
            .filter(|v| *v != 0.0)
            .or(parent_params.as_ref().map(|p| p.1).filter(|v| *v != 0.0))
            .unwrap_or(0.0);
        let prefetch_watermark = props
            .prefetch_watermark
            .filter(|v| *v != 0.0)
            .or(parent_params.as_ref().map(|p| p.2).filter(|v| *v != 0.0))
            .unwrap_or(0.0);

        let tick_quantum = if rate >= 0.0 { rate / TICKS_PER_SECOND } else { 0.0 };
        let filling_epsilon = tick_quantum * EPSILON_COEFFICIENT;
        let burst = tick_quantum * RESOURCE_BURST_COEFFICIENT;

        let new_weight = props.weight.unwrap_or(1).max(1);
        let old_weight = self.node(idx).weight;
        if new_weight != old_weight && self.node(idx).active {
            if let Some(parent) = parent {
                let body = self.res_mut(parent);
                body.active_children_weight =
                    body.active_children_weight + new_weight as u64 - old_weight as u64;
            }
        }

        let effective_accounting = props
            .accounting
            .clone()
            .unwrap_or_default()
            .effective(parent_params.as_ref().map(|p| &p.3));

        {
            let has_active_children = self.res(idx).current_active_child.is_some();
            let node = self.node_mut(idx);
            node.weight = new_weight;
            let cap = if has_active_children { tick_quantum } else { burst };
            node.free_resource = node.free_resource.min(cap);
        }
        {
            let quoter_path = self.quoter_path.clone();
            let sink = self.bill_sink.clone();
            let body = self.res_mut(idx);
            body.max_units_per_second = rate;
            body.prefetch_coefficient = prefetch_coefficient;
            body.prefetch_watermark = prefetch_watermark;
            body.tick_quantum = tick_quantum;
            body.filling_epsilon = filling_epsilon;
            body.burst = burst;
            body.effective_accounting = effective_accounting.clone();

            if effective_accounting.enabled {
                match &mut body.accounting {
                    Some(accounting) => accounting.configure(effective_accounting, rate),
                    None => {
                        body.accounting = Some(RateAccounting::new(
                            effective_accounting,
                            rate,
                            sink,
                            quoter_path,
                            body.path.clone(),
                        ))
                    }
                }
            } else {
                body.accounting = None;
                body.active_accounting = false;
            }

            metrics::gauge!("quoter_limit_units_per_second", "resource" => body.path.clone())
                .set(rate);
        }

        for child in self.res(idx).children.clone() {
            self.calc_parameters(child);
        }
    }

    // Marks the subtree's sessions to re-send effective props and clamps
    // their balance to the new limits.
    fn on_props_changed(&mut self, idx: usize) {
        let (burst, resource_id) = (self.res(idx).burst, self.res(idx).id);
        for client in self.res(idx).session_clients.clone() {
            if let Some(&s_idx) = self.sessions.get(&(client, resource_id)) {
                let requested = self.session_body(s_idx).amount_requested;
                let node = self.node_mut(s_idx);
                node.free_resource = node.free_resource.min(requested + burst);
                self.session_body_mut(s_idx).need_send_changed_props = true;
            }
        }
        for child in self.res(idx).children.clone() {
            self.on_props_changed(child);
        }
    }

    /// The resolved effective configuration of a resource, as reported to
    /// sessions alongside allocations after a props change.
    pub fn effective_config(&self, resource_id: u64) -> Option<ResourceConfig> {
        let idx = *self.by_id.get(&resource_id)?;
        let body = self.res(idx);
        Some(ResourceConfig {
            max_units_per_second: Some(body.max_units_per_second),
            prefetch_coefficient: Some(body.prefetch_coefficient),
            prefetch_watermark: Some(body.prefetch_watermark),
            weight: Some(self.node(idx).weight),
            accounting: body.accounting.as_ref().map(|a| a.config().clone()),
        })
    }

    // ---- sessions ----

    /// Creates (or finds) the session of `client` on the resource at `path`.
    pub fn subscribe(&mut self, client: ClientId, path: &str) -> Result<(u64, ResourceConfig), Error> {
        let canon = canonize_path(path)?;
        let idx = *self.by_path.get(&canon).ok_or_else(|| Error::ResourceNotFound(canon.clone()))?;
        let resource_id = self.res(idx).id;

        if !self.sessions.contains_key(&(client, resource_id)) {
            let s_idx = self.alloc(Node {
                parent: Some(idx),
                weight: 1,
                active: false,
                free_resource: 0.0,
                ring_prev: 0,
                ring_next: 0,
                body: NodeBody::Session(SessionBody {
                    client,
                    resource_id,
                    amount_requested: 0.0,
                    need_send_changed_props: false,
                    total_consumed: 0.0,
                }),
            });
            self.sessions.insert((client, resource_id), s_idx);
            self.res_mut(idx).session_clients.push(client);
            metrics::gauge!("quoter_sessions", "resource" => canon.clone()).increment(1.0);
        }
        let effective = self.effective_config(resource_id).expect("resource exists");
        Ok((resource_id, effective))
    }

    /// Starts or stops token consumption for one session.
    pub fn update_consumption_state(
        &mut self,
        client: ClientId,
        resource_id: u64,
        consume: bool,
        amount: f64,
        now_us: u64,
    ) -> Result<(), Error> {
        let s_idx = *self
            .sessions
            .get(&(client, resource_id))
            .ok_or(Error::SessionNotFound { client, resource_id })?;
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        let eps = self.res(res_idx).filling_epsilon;

        tracing::trace!(client, resource_id, consume, amount, "update consumption state");

        let mut queue = TickProcessorQueue::default();
        if consume {
            self.session_body_mut(s_idx).amount_requested = amount.max(2.0 * eps);
            if !self.node(s_idx).active {
                self.session_activate(s_idx, &mut queue, now_us);
                self.schedule_session(s_idx, now_us, &mut queue);
            }
            self.send_available_resource(s_idx);
        } else {
            self.session_body_mut(s_idx).amount_requested = 0.0;
            let full = self.session_is_full(s_idx);
            if self.node(s_idx).active && full {
                self.session_deactivate(s_idx);
            } else if !self.node(s_idx).active && !full {
                self.session_activate(s_idx, &mut queue, now_us);
                self.schedule_session(s_idx, now_us, &mut queue);
            }
        }
        self.queue.merge(queue);
        Ok(())
    }

    /// Feeds metered usage into the nearest ancestor with accounting enabled.
    /// Returns the timestamp accepted so far.
    pub fn report(
        &mut self,
        client: ClientId,
        resource_id: u64,
        start_us: u64,
        interval_us: u64,
        values: &[f64],
        now_us: u64,
    ) -> Result<u64, Error> {
        let s_idx = *self
            .sessions
            .get(&(client, resource_id))
            .ok_or(Error::SessionNotFound { client, resource_id })?;
        let res_idx = self.node(s_idx).parent.expect("session has a resource");

        let mut queue = TickProcessorQueue::default();
        let accepted = self.resource_report(res_idx, start_us, interval_us, values, now_us, &mut queue);
        self.queue.merge(queue);
        Ok(accepted)
    }

    fn resource_report(
        &mut self,
        idx: usize,
        start_us: u64,
        interval_us: u64,
        values: &[f64],
        now_us: u64,
        queue: &mut TickProcessorQueue,
    ) -> u64 {
        if self.res(idx).accounting.is_some() {
            let body = self.res_mut(idx);
            let accepted = body
                .accounting
                .as_mut()
                .expect("accounting checked above")
                .report(start_us, interval_us, values);
            body.active_accounting = true;
            self.schedule_resource(idx, now_us, queue);
            accepted
        } else if let Some(parent) = self.node(idx).parent {
            self.resource_report(parent, start_us, interval_us, values, now_us, queue)
        } else {
            // No accounting anywhere up the path: the data is skipped.
            0
        }
    }

    /// Closes every session of a disconnected client.
    pub fn disconnect_client(&mut self, client: ClientId) {
        let resources: Vec<u64> = self
            .sessions
            .keys()
            .filter(|(c, _)| *c == client)
            .map(|(_, r)| *r)
            .collect();
        for resource_id in resources {
            self.close_session(client, resource_id, StatusCode::BadSession, "disconnected");
        }
    }

    fn close_session(&mut self, client: ClientId, resource_id: u64, status: StatusCode, reason: &str) {
        let Some(s_idx) = self.sessions.remove(&(client, resource_id)) else {
            return;
        };
        if self.node(s_idx).active {
            self.session_deactivate(s_idx);
        }
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        let path = self.res(res_idx).path.clone();
        self.res_mut(res_idx).session_clients.retain(|&c| c != client);
        self.release(s_idx);
        metrics::gauge!("quoter_sessions", "resource" => path).decrement(1.0);
        self.events.push(SessionEvent::Closed {
            client,
            resource_id,
            status,
            reason: reason.to_string(),
        });
    }

    // ---- DRR scheduling ----

    fn schedule_resource(&mut self, idx: usize, now_us: u64, queue: &mut TickProcessorQueue) {
        let id = self.res(idx).id;
        queue.push(TickTask { time: next_tick(now_us), processor: ProcessorId::Resource(id) });
    }

    fn schedule_session(&mut self, s_idx: usize, now_us: u64, queue: &mut TickProcessorQueue) {
        let body = self.session_body(s_idx);
        let (client, resource) = (body.client, body.resource_id);
        queue.push(TickTask {
            time: next_tick(now_us),
            processor: ProcessorId::Session { client, resource },
        });
    }

    fn session_is_full(&self, s_idx: usize) -> bool {
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        let burst = self.res(res_idx).burst;
        let eps = self.res(res_idx).filling_epsilon;
        let free = self.node(s_idx).free_resource;
        free >= burst || almost_equal(free, burst, eps)
    }

    fn resource_is_full(&self, idx: usize) -> bool {
        let body = self.res(idx);
        let free = self.node(idx).free_resource;
        free >= body.burst || almost_equal(free, body.burst, body.filling_epsilon)
    }

    fn has_active_children(&self, idx: usize) -> bool {
        self.res(idx).current_active_child.is_some()
    }

    fn session_activate(&mut self, s_idx: usize, queue: &mut TickProcessorQueue, now_us: u64) {
        debug_assert!(!self.node(s_idx).active);
        self.node_mut(s_idx).active = true;
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        self.add_active_child(res_idx, s_idx, queue, now_us);
        let path = self.res(res_idx).path.clone();
        metrics::gauge!("quoter_active_sessions", "resource" => path).increment(1.0);
    }

    fn session_deactivate(&mut self, s_idx: usize) {
        debug_assert!(self.node(s_idx).active);
        self.node_mut(s_idx).active = false;
        self.session_body_mut(s_idx).amount_requested = 0.0;
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        self.remove_active_child(res_idx, s_idx);
        let path = self.res(res_idx).path.clone();
        metrics::gauge!("quoter_active_sessions", "resource" => path).decrement(1.0);
    }

    fn add_active_child(
        &mut self,
        idx: usize,
        child: usize,
        queue: &mut TickProcessorQueue,
        now_us: u64,
    ) {
        if !self.has_active_children(idx) {
            let child_weight = self.node(child).weight as u64;
            {
                let body = self.res_mut(idx);
                body.current_active_child = Some(child);
                body.active_children_count = 1;
                debug_assert_eq!(body.active_children_weight, 0);
                body.active_children_weight = child_weight;
            }
            self.node_mut(idx).active = true;
            self.schedule_resource(idx, now_us, queue);
            if let Some(parent) = self.node(idx).parent {
                self.add_active_child(parent, idx, queue, now_us);
            }
        } else {
            let current = self.res(idx).current_active_child.expect("has active children");
            let detached = self.node(child).ring_next == child && current != child;
            if detached {
                self.ring_insert_before(current, child);
                let child_weight = self.node(child).weight as u64;
                let body = self.res_mut(idx);
                body.active_children_count += 1;
                body.active_children_weight += child_weight;
            }
        }
    }

    fn remove_active_child(&mut self, idx: usize, child: usize) {
        if !self.has_active_children(idx) {
            return;
        }
        if self.res(idx).current_active_child == Some(child) {
            let next = self.node(child).ring_next;
            self.res_mut(idx).current_active_child = Some(next);
        }
        self.ring_remove(child);
        let child_weight = self.node(child).weight as u64;
        {
            let body = self.res_mut(idx);
            body.active_children_count -= 1;
            debug_assert!(body.active_children_weight >= child_weight);
            body.active_children_weight -= child_weight;
        }
        if self.res(idx).current_active_child == Some(child) {
            let body = self.res_mut(idx);
            body.current_active_child = None;
            debug_assert_eq!(body.active_children_count, 0);
        }
    }

    fn deactivate_if_full(&mut self, idx: usize) {
        if !self.has_active_children(idx) && self.resource_is_full(idx) && self.node(idx).active {
            self.node_mut(idx).active = false;
            tracing::trace!(path = %self.res(idx).path, "resource deactivated");
            if let Some(parent) = self.node(idx).parent {
                self.remove_active_child(parent, idx);
            }
        }
    }

    // Returns the amount actually spent by the consumer.
    fn accumulate(&mut self, idx: usize, amount: f64, now_us: u64) -> f64 {
        match &self.node(idx).body {
            NodeBody::Resource(_) => self.resource_accumulate(idx, amount),
            NodeBody::Session(_) => self.session_accumulate(idx, amount, now_us),
        }
    }

    fn resource_accumulate(&mut self, idx: usize, amount: f64) -> f64 {
        let (quantum, eps, burst) = {
            let body = self.res(idx);
            (body.tick_quantum, body.filling_epsilon, body.burst)
        };
        let cap = if self.has_active_children(idx) { quantum } else { burst };
        let amount = amount.min(quantum);

        let free = self.node(idx).free_resource;
        let new_free = (free + amount).min(cap);
        let mut spent = new_free - free;
        self.node_mut(idx).free_resource = new_free;
        if spent < eps {
            spent = 0.0;
        }
        self.deactivate_if_full(idx);
        spent
    }

    fn session_accumulate(&mut self, s_idx: usize, amount: f64, _now_us: u64) -> f64 {
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        let (eps, burst) = {
            let body = self.res(res_idx);
            (body.filling_epsilon, body.burst)
        };
        let requested = self.session_body(s_idx).amount_requested;

        let free = self.node(s_idx).free_resource;
        let new_free = (free + amount).min(requested + burst);
        let mut spent = new_free - free;
        self.node_mut(s_idx).free_resource = new_free;
        if spent < eps {
            spent = 0.0;
        }
        if requested < eps && self.session_is_full(s_idx) {
            self.session_deactivate(s_idx);
        }
        spent
    }

    // Hands the session's balance to its client, up to the requested amount.
    fn send_available_resource(&mut self, s_idx: usize) {
        let res_idx = self.node(s_idx).parent.expect("session has a resource");
        let (eps, burst, resource_id) = {
            let body = self.res(res_idx);
            (body.filling_epsilon, body.burst, body.id)
        };

        if self.node(s_idx).free_resource < eps {
            return;
        }
        if self.session_body(s_idx).amount_requested >= eps {
            let free = self.node(s_idx).free_resource;
            let requested = self.session_body(s_idx).amount_requested;
            let spent = requested.min(free);

            let effective = if self.session_body(s_idx).need_send_changed_props {
                self.effective_config(resource_id)
            } else {
                None
            };
            let client = self.session_body(s_idx).client;
            self.events.push(SessionEvent::Allocated { client, resource_id, amount: spent, effective });
            {
                let body = self.session_body_mut(s_idx);
                body.need_send_changed_props = false;
                body.total_consumed += spent;
                body.amount_requested -= spent;
            }
            self.node_mut(s_idx).free_resource -= spent;
            self.add_allocated(res_idx, spent);
        }
        if self.session_body(s_idx).amount_requested < eps {
            self.session_body_mut(s_idx).amount_requested = 0.0;
            let node = self.node_mut(s_idx);
            node.free_resource = node.free_resource.min(burst);
            if self.session_is_full(s_idx) {
                self.session_deactivate(s_idx);
            }
        }
    }

    // The allocated counter accumulates along the ancestor chain, carrying
    // the fractional remainder so integer counters don't drift.
    fn add_allocated(&mut self, res_idx: usize, spent: f64) {
        let mut cursor = Some(res_idx);
        while let Some(idx) = cursor {
            let body = self.res_mut(idx);
            body.allocated_remainder += spent;
            let whole = body.allocated_remainder.floor();
            body.allocated_remainder -= whole;
            if whole > 0.0 {
                metrics::counter!("quoter_allocated_units_total", "resource" => body.path.clone())
                    .increment(whole as u64);
            }
            cursor = self.node(idx).parent;
        }
    }

    fn resource_do_process(&mut self, idx: usize, now_us: u64, queue: &mut TickProcessorQueue) {
        if self.node(idx).active {
            if self.node(idx).parent.is_none() {
                let quantum = self.res(idx).tick_quantum;
                self.resource_accumulate(idx, quantum);
            }

            if self.has_active_children(idx) {
                let eps = self.res(idx).filling_epsilon;
                let sum_weights = self.res(idx).active_children_weight.max(1);
                let quantum = (self.node(idx).free_resource / sum_weights as f64).max(eps);
                // This count is non-increasing during the sweep.
                let active_children_count = self.res(idx).active_children_count;
                let mut children_processed = 0usize;
                let mut free_before_cycle = self.node(idx).free_resource;

                while self.node(idx).free_resource >= eps && self.has_active_children(idx) {
                    let child = self.res(idx).current_active_child.expect("has active children");
                    let next = self.node(child).ring_next;
                    self.res_mut(idx).current_active_child = Some(next);

                    let weight = self.node(child).weight;
                    let mut amount = quantum;
                    if weight != 1 {
                        amount *= weight as f64;
                    }
                    let give = amount.clamp(eps, self.node(idx).free_resource);
                    let spent = self.accumulate(child, give, now_us);
                    self.node_mut(idx).free_resource -= spent;

                    children_processed += 1;
                    if children_processed == active_children_count {
                        // A full sweep produced no progress: every child is full.
                        if almost_equal(self.node(idx).free_resource, free_before_cycle, eps) {
                            break;
                        }
                        children_processed = 0;
                        free_before_cycle = self.node(idx).free_resource;
                    }
                }
            }

            self.deactivate_if_full(idx);
        }

        if self.res(idx).active_accounting {
            let body = self.res_mut(idx);
            let still_active = match &mut body.accounting {
                Some(accounting) => accounting.run_accounting(now_us),
                None => false,
            };
            body.active_accounting = still_active;
        }

        if self.node(idx).active || self.res(idx).active_accounting {
            self.schedule_resource(idx, now_us, queue);
        }
    }

    fn session_do_process(&mut self, s_idx: usize, now_us: u64, queue: &mut TickProcessorQueue) {
        if self.node(s_idx).active {
            self.send_available_resource(s_idx);
            if self.node(s_idx).active {
                self.schedule_session(s_idx, now_us, queue);
            }
        }
    }

    fn process_tick(&mut self, task: TickTask, queue: &mut TickProcessorQueue) {
        match task.processor {
            ProcessorId::Resource(id) => {
                if let Some(&idx) = self.by_id.get(&id) {
                    self.resource_do_process(idx, task.time, queue);
                }
            }
            ProcessorId::Session { client, resource } => {
                if let Some(&s_idx) = self.sessions.get(&(client, resource)) {
                    self.session_do_process(s_idx, task.time, queue);
                }
            }
        }
    }

    /// Processes every tick due at or before `now_us`.
    pub fn run_until(&mut self, now_us: u64) {
        while let Some(task) = self.queue.peek() {
            if task.time > now_us {
                break;
            }
            self.queue.pop();
            let mut fresh = TickProcessorQueue::default();
            self.process_tick(task, &mut fresh);
            self.queue.merge(fresh);
        }
    }

    /// Total tokens a session has consumed over its lifetime.
    pub fn total_consumed(&self, client: ClientId, resource_id: u64) -> f64 {
        self.sessions
            .get(&(client, resource_id))
            .map(|&s_idx| self.session_body(s_idx).total_consumed)
            .unwrap_or(0.0)
    }
}
