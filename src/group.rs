//! The scheduling domain: owns every run stack and cothread, ticks the
//! logical clock, scores run stacks for new placements, and drives the
//! rendezvous state machine across direct and control-stack-routed
//! switches.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::arch;
use crate::cothread::{CothreadId, CothreadRecord, CothreadState, CothreadStorage};
use crate::error::SendError;
use crate::message::Message;
use crate::run_stack::RunStack;
use crate::stack::StackRegion;

/// Number of run stacks is clamped to this range.
pub const MIN_STK_NUM: usize = 4;
pub const MAX_STK_NUM: usize = 16;
/// Per-stack capacity is clamped to this range, in bytes.
pub const MIN_STK_CAP: usize = 2 * 1024 * 1024;
pub const MAX_STK_CAP: usize = 10 * 1024 * 1024;

const LIGHT_WEIGHT_STACK_SIZE: usize = 10 * 1024;
const CONTROL_STACK_SIZE: usize = 4 * 1024;

/// Once a run stack's decayed weight (frequency + member count) exceeds
/// this, the placement policy prefers spawning a new run stack over piling
/// onto the least-loaded existing one (capacity permitting).
const MIN_FREQ_THRESHOLD: u64 = 20;
/// Logical-clock ticks between frequency-aging passes.
const FREQ_UPDATE_PERIOD: u64 = 100;

/// A cothread's entry point: receives its own handle and the message it was
/// first sent, and runs until it returns or calls [`Cothread::exit`].
pub type EntryFn = fn(&Cothread, Message);

pub(crate) struct Inner {
    run_stacks: Vec<RunStack>,
    cothreads: Vec<Option<Box<CothreadRecord>>>,
    main: CothreadId,
    control_stack: StackRegion,
    stack_capacity: usize,
    clock: u64,
}

impl Inner {
    fn record_ptr(&self, id: CothreadId) -> *mut CothreadRecord {
        self.cothreads[id.0]
            .as_deref()
            .expect("cothread id referenced after destruction")
            as *const CothreadRecord as *mut CothreadRecord
    }

    fn record(&self, id: CothreadId) -> &CothreadRecord {
        unsafe { &*self.record_ptr(id) }
    }

    fn record_mut(&mut self, id: CothreadId) -> &mut CothreadRecord {
        self.cothreads[id.0]
            .as_deref_mut()
            .expect("cothread id referenced after destruction")
    }

    fn tick(&mut self) {
        self.clock += 1;
        if self.clock % FREQ_UPDATE_PERIOD == 0 {
            for stack in &mut self.run_stacks {
                stack.age();
            }
        }
    }

    /// Placement policy: picks the least-loaded run stack, or spawns a new
    /// one if every existing stack is too hot and the cap allows it.
    fn find_run_stack(&mut self) -> usize {
        let mut best: Option<(usize, u64)> = None;
        for (idx, stack) in self.run_stacks.iter().enumerate() {
            let weight = stack.weight();
            if best.map(|(_, w)| weight < w).unwrap_or(true) {
                best = Some((idx, weight));
            }
        }
        let (best_idx, best_weight) = best.expect("a group always owns at least one run stack");

        if best_weight > MIN_FREQ_THRESHOLD && self.run_stacks.len() < MAX_STK_NUM {
            let region = StackRegion::new(self.stack_capacity)
                .expect("failed to allocate an additional run stack");
            self.run_stacks.push(RunStack::new(region));
            let idx = self.run_stacks.len() - 1;
            log::info!("placement policy spawned run stack #{idx}");
            idx
        } else {
            best_idx
        }
    }

    /// Pointer back to this `Inner` as seen through the `UnsafeCell` every
    /// handle's `Rc` actually points at. Sound because `UnsafeCell<T>` is
    /// guaranteed layout-compatible with `T`.
    fn self_ptr(&self) -> *const UnsafeCell<Inner> {
        (self as *const Inner).cast()
    }

    fn add_cothread(&mut self, entry: EntryFn, light_weight: bool) -> CothreadId {
        let id = CothreadId(self.cothreads.len());
        let group = self.self_ptr();

        let (storage, stk_bot, stk_sp) = if light_weight {
            let region =
                StackRegion::new(LIGHT_WEIGHT_STACK_SIZE).expect("failed to allocate a stack");
            let stk_bot = region.high();
            let stk_sp = unsafe { arch::prime_stack(stk_bot, trampoline) };
            (CothreadStorage::LightWeight(region), stk_bot, stk_sp)
        } else {
            let run_stack = self.find_run_stack();
            let stk_bot = self.run_stacks[run_stack].region.high();
            let frame_len = arch::INITIAL_FRAME_BYTES;
            let stk_sp = unsafe { stk_bot.sub(frame_len) };

            let mut backup = vec![0u8; frame_len];
            unsafe {
                let scratch_top = backup.as_mut_ptr().add(frame_len);
                arch::prime_stack(scratch_top, trampoline);
            }

            self.run_stacks[run_stack].members.push(id);
            (CothreadStorage::Heavy { run_stack, backup }, stk_bot, stk_sp)
        };

        self.cothreads.push(Some(Box::new(CothreadRecord {
            id,
            group,
            storage,
            stk_bot,
            stk_sp,
            state: CothreadState::Init,
            sender: None,
            message: Message::NONE,
            entry: Some(entry),
        })));

        log::debug!(
            "created cothread {} ({})",
            id.0,
            if light_weight { "light-weight" } else { "heavy" }
        );

        id
    }

    fn destroy_cothread(&mut self, id: CothreadId) {
        let record = self.record(id);
        assert!(
            record.state != CothreadState::Running,
            "cannot destroy a running cothread"
        );
        let run_stack = match &record.storage {
            CothreadStorage::Heavy { run_stack, .. } => Some(*run_stack),
            _ => None,
        };

        if let Some(run_stack) = run_stack {
            if self.run_stacks[run_stack].active == Some(id) {
                self.run_stacks[run_stack].active = None;
            }
            self.run_stacks[run_stack].members.retain(|&m| m != id);
        }

        log::debug!("destroyed cothread {}", id.0);
        self.cothreads[id.0] = None;
    }

    /// Moves `target`'s bytes onto its run stack, backing up whatever was
    /// previously resident there first. Called only from the control-stack
    /// trampoline, where `target` is known heavy and non-resident.
    fn place_on_run_stack(&mut self, run_stack: usize, target: CothreadId) {
        let prev = self.run_stacks[run_stack].active;
        if let Some(prev_id) = prev {
            if prev_id != target {
                self.backup(prev_id, run_stack);
                self.run_stacks[run_stack].note_swap();
            }
        }
        self.restore(target, run_stack);
        self.run_stacks[run_stack].active = Some(target);
    }

    fn backup(&mut self, id: CothreadId, run_stack: usize) {
        let record = self.record_mut(id);
        let len = unsafe { record.stk_bot.offset_from(record.stk_sp) as usize };
        let backup = match &mut record.storage {
            CothreadStorage::Heavy { backup, .. } => backup,
            _ => unreachable!("only heavy cothreads are backed up"),
        };
        backup.resize(len, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(record.stk_sp, backup.as_mut_ptr(), len);
        }
        let _ = run_stack;
    }

    fn restore(&mut self, id: CothreadId, _run_stack: usize) {
        let record = self.record_mut(id);
        let backup = match &mut record.storage {
            CothreadStorage::Heavy { backup, .. } => backup,
            _ => unreachable!("only heavy cothreads are restored"),
        };
        let len = backup.len();
        unsafe {
            std::ptr::copy_nonoverlapping(backup.as_ptr(), record.stk_sp, len);
        }
        backup.clear();
    }

    fn is_resident(&self, id: CothreadId) -> bool {
        match &self.record(id).storage {
            CothreadStorage::Main | CothreadStorage::LightWeight(_) => true,
            CothreadStorage::Heavy { run_stack, .. } => self.run_stacks[*run_stack].active == Some(id),
        }
    }

    /// Switches the currently-running cothread `me` to `her`, returning
    /// once control comes back to `me`. Direct switches bypass the control
    /// stack entirely; a non-resident heavy cothread is routed through it so
    /// the backup/restore dance runs off of `me`'s own (possibly shared)
    /// stack.
    fn switch_to(&mut self, me: CothreadId, her: CothreadId) {
        let her_ptr = self.record_ptr(her);
        let me_ptr = self.record_ptr(me);

        if self.is_resident(her) {
            log::trace!("direct switch {} -> {}", me.0, her.0);
            let her_sp = unsafe { (*her_ptr).stk_sp };
            unsafe {
                arch::switch(her_ptr.cast(), &mut (*me_ptr).stk_sp, her_sp);
            }
        } else {
            log::trace!("control-stack switch {} -> {}", me.0, her.0);
            let ctl_top = self.control_stack.high();
            let ctl_sp = unsafe { arch::prime_stack(ctl_top, aux_switch_trampoline) };
            unsafe {
                arch::switch(her_ptr.cast(), &mut (*me_ptr).stk_sp, ctl_sp);
            }
        }

        self.tick();
        unsafe {
            (*me_ptr).state = CothreadState::Running;
        }
    }
}

/// Recovers an owned, strong `Rc` handle from a raw back-reference pointer
/// known to have been derived from a live `Rc<UnsafeCell<Inner>>` (every
/// `CothreadRecord::group` pointer is). Bumps the strong count rather than
/// stealing it, since the original owner keeps running.
unsafe fn rc_from_raw(ptr: *const UnsafeCell<Inner>) -> Rc<UnsafeCell<Inner>> {
    unsafe {
        Rc::increment_strong_count(ptr);
        Rc::from_raw(ptr)
    }
}

/// Entry point every freshly created cothread's stack is primed to resume
/// into. Runs the user's entry function to completion, then exits.
unsafe extern "C" fn trampoline(cth: *mut u8) -> ! {
    let record_ptr = cth.cast::<CothreadRecord>();
    let (group_ptr, id, entry, message) = unsafe {
        let record = &mut *record_ptr;
        record.state = CothreadState::Running;
        (
            record.group,
            record.id,
            record.entry.take().expect("a cothread's stack resumed twice"),
            record.message,
        )
    };
    let group = unsafe { rc_from_raw(group_ptr) };
    unsafe { (*group.get()).tick() };

    let handle = Cothread {
        inner: group,
        id,
        _not_send: PhantomData,
    };
    entry(&handle, message);
    handle.exit();
}

/// Resume point for the control stack: places the target cothread onto its
/// run stack (backing up whoever was resident first), then switches into it
/// directly. The control stack's own outgoing stack pointer is discarded —
/// it is never resumed.
unsafe extern "C" fn aux_switch_trampoline(target: *mut u8) -> ! {
    let target_ptr = target.cast::<CothreadRecord>();
    let (inner_ptr, run_stack, id) = unsafe {
        let record = &*target_ptr;
        let run_stack = match &record.storage {
            CothreadStorage::Heavy { run_stack, .. } => *run_stack,
            _ => unreachable!("only non-resident heavy cothreads are routed through the control stack"),
        };
        ((*record.group).get(), run_stack, record.id)
    };
    unsafe { (*inner_ptr).place_on_run_stack(run_stack, id) };

    let target_sp = unsafe { (*target_ptr).stk_sp };
    let mut discard: *mut u8 = std::ptr::null_mut();
    unsafe { arch::switch(target, &mut discard, target_sp) };
    unreachable!("the control stack is never resumed");
}

/// A scheduling domain: a set of run stacks and cothreads governed by one
/// main cothread representing the external caller.
pub struct Group {
    inner: Rc<UnsafeCell<Inner>>,
    main: CothreadId,
    _not_send: PhantomData<*mut ()>,
}

impl Group {
    /// Creates a group with `num_stacks` run stacks of `per_stack_capacity`
    /// bytes each, both clamped to this crate's documented ranges.
    pub fn create(num_stacks: usize, per_stack_capacity: usize) -> Group {
        let num_stacks = num_stacks.clamp(MIN_STK_NUM, MAX_STK_NUM);
        let per_stack_capacity = per_stack_capacity.clamp(MIN_STK_CAP, MAX_STK_CAP);

        let run_stacks = (0..num_stacks)
            .map(|_| {
                RunStack::new(
                    StackRegion::new(per_stack_capacity).expect("failed to allocate a run stack"),
                )
            })
            .collect();
        let control_stack =
            StackRegion::new(CONTROL_STACK_SIZE).expect("failed to allocate the control stack");

        let main = CothreadId(0);
        let inner = Rc::new(UnsafeCell::new(Inner {
            run_stacks,
            cothreads: vec![Some(Box::new(CothreadRecord {
                id: main,
                // Patched in immediately below, once `inner`'s address is
                // stable; a raw pointer has no validity invariant to
                // violate in the meantime, unlike the `Rc` it will become.
                group: std::ptr::null(),
                storage: CothreadStorage::Main,
                stk_bot: std::ptr::null_mut(),
                stk_sp: std::ptr::null_mut(),
                state: CothreadState::Running,
                sender: None,
                message: Message::NONE,
                entry: None,
            }))],
            main,
            control_stack,
            stack_capacity: per_stack_capacity,
            clock: 0,
        }));

        unsafe {
            let self_ptr = (*inner.get()).self_ptr();
            (*inner.get()).record_mut(main).group = self_ptr;
        }

        log::info!("created group with {num_stacks} run stacks of {per_stack_capacity} bytes");

        Group {
            inner,
            main,
            _not_send: PhantomData,
        }
    }

    /// The group's main cothread: the external caller that created it.
    pub fn main(&self) -> Cothread {
        Cothread {
            inner: self.inner.clone(),
            id: self.main,
            _not_send: PhantomData,
        }
    }

    /// Tears the group down: every cothread, then every run stack, then the
    /// control stack. Only valid when the main cothread is the sole
    /// surviving, running member (i.e. nothing else is mid-rendezvous).
    pub fn destroy(self) {
        let inner = unsafe { &mut *self.inner.get() };
        assert!(
            inner.record(self.main).state == CothreadState::Running,
            "group destroyed while a non-main cothread is running"
        );
        for id in 0..inner.cothreads.len() {
            inner.cothreads[id] = None;
        }
        inner.run_stacks.clear();
        log::info!("destroyed group");
    }
}

/// A handle to one cothread within a [`Group`]. Confined to the thread that
/// created its group: cothreads never migrate across OS threads.
pub struct Cothread {
    inner: Rc<UnsafeCell<Inner>>,
    id: CothreadId,
    _not_send: PhantomData<*mut ()>,
}

impl Clone for Cothread {
    fn clone(&self) -> Self {
        Cothread {
            inner: self.inner.clone(),
            id: self.id,
            _not_send: PhantomData,
        }
    }
}

impl Cothread {
    fn inner(&self) -> &Inner {
        unsafe { &*self.inner.get() }
    }

    fn inner_mut(&self) -> &mut Inner {
        unsafe { &mut *self.inner.get() }
    }

    fn assert_running(&self, op: &str) {
        assert!(
            self.inner().record(self.id).state == CothreadState::Running,
            "{op} called by a cothread that is not currently running"
        );
    }

    /// Creates a new cothread in this one's group. `light_weight` selects a
    /// dedicated stack over sharing a run stack.
    pub fn create(&self, entry: EntryFn, light_weight: bool) -> Cothread {
        self.assert_running("Cothread::create");
        let id = self.inner_mut().add_cothread(entry, light_weight);
        Cothread {
            inner: self.inner.clone(),
            id,
            _not_send: PhantomData,
        }
    }

    /// Destroys `self`. Fatal if `self` is currently running.
    pub fn destroy(self) {
        self.inner_mut().destroy_cothread(self.id);
    }

    /// Sends `msg` to `her` and blocks until it suspends (via `yield` or
    /// `reply`) or exits. Returns the reply payload, or `Err(Closed)` if
    /// `her` had already exited (no switch occurs in that case).
    pub fn send(&self, her: &Cothread, msg: Message) -> Result<Message, SendError> {
        self.assert_running("Cothread::send");
        assert!(
            self.same_group(her),
            "cannot send across cothread groups"
        );

        if self.inner().record(her.id).state == CothreadState::Exited {
            return Err(SendError::Closed);
        }
        assert!(
            self.inner().record(her.id).sender.is_none(),
            "send target is already the subject of another send"
        );

        {
            let inner = self.inner_mut();
            let her_record = inner.record_mut(her.id);
            her_record.message = msg;
            her_record.sender = Some(self.id);
            inner.record_mut(self.id).state = CothreadState::Sending;
        }

        self.inner_mut().switch_to(self.id, her.id);

        let inner = self.inner_mut();
        inner.record_mut(her.id).sender = None;
        if inner.record(her.id).state == CothreadState::Exited {
            Err(SendError::Closed)
        } else {
            Ok(inner.record(self.id).message)
        }
    }

    fn suspend_to_sender(&self, state: CothreadState, msg: Message) -> Message {
        let sender = self
            .inner()
            .record(self.id)
            .sender
            .expect("yield/reply called by a cothread with no pending sender");

        {
            let inner = self.inner_mut();
            inner.record_mut(sender).message = msg;
            inner.record_mut(self.id).state = state;
        }

        self.inner_mut().switch_to(self.id, sender);

        self.inner().record(self.id).message
    }

    /// Suspends back to whoever sent to this cothread, delivering `msg`,
    /// and returns the next message sent. Marks the suspension as a
    /// `Yielding` transition.
    pub fn r#yield(&self, msg: Message) -> Message {
        self.suspend_to_sender(CothreadState::Yielding, msg)
    }

    /// Identical to [`Cothread::yield`] except the suspension is recorded
    /// as `Replying`.
    pub fn reply(&self, msg: Message) -> Message {
        self.suspend_to_sender(CothreadState::Replying, msg)
    }

    /// Marks this cothread exited and switches back to its sender. Never
    /// returns.
    pub fn exit(&self) -> ! {
        let sender = self
            .inner()
            .record(self.id)
            .sender
            .expect("exit called by a cothread with no pending sender");
        self.inner_mut().record_mut(self.id).state = CothreadState::Exited;
        self.inner_mut().switch_to(self.id, sender);
        unreachable!("an exited cothread must never be resumed")
    }

    pub fn state(&self) -> CothreadState {
        self.inner().record(self.id).state
    }

    pub fn sender(&self) -> Option<Cothread> {
        self.inner().record(self.id).sender.map(|id| Cothread {
            inner: self.inner.clone(),
            id,
            _not_send: PhantomData,
        })
    }

    pub fn same_group(&self, her: &Cothread) -> bool {
        Rc::ptr_eq(&self.inner, &her.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yield_once(me: &Cothread, first: Message) {
        me.r#yield(first);
    }

    #[test]
    fn placement_policy_reuses_run_stacks_under_pressure() {
        let group = Group::create(4, MIN_STK_CAP);
        let main = group.main();

        let workers: Vec<_> = (0..50).map(|_| main.create(yield_once, false)).collect();
        for w in &workers {
            main.send(w, Message::from_usize(0)).unwrap();
        }

        let inner = unsafe { &*group.inner.get() };
        assert!(inner.run_stacks.len() <= MAX_STK_NUM);
        assert!(
            inner.run_stacks.iter().any(|s| s.members.len() > 1),
            "50 heavy cothreads over a 4-stack cap should force reuse of at least one stack"
        );

        for w in workers {
            w.destroy();
        }
        group.destroy();
    }

    fn echo_forever(me: &Cothread, first: Message) {
        let mut msg = first;
        loop {
            msg = me.r#yield(msg);
        }
    }

    #[test]
    fn frequency_ages_after_update_period() {
        let group = Group::create(MIN_STK_NUM, MIN_STK_CAP);
        let main = group.main();

        // Pack two heavy cothreads per run stack so alternating sends
        // between a pair sharing one stack force a backup/restore swap on
        // every single send.
        let workers: Vec<_> = (0..2 * MIN_STK_NUM)
            .map(|_| main.create(echo_forever, false))
            .collect();
        for w in &workers {
            main.send(w, Message::from_usize(0)).unwrap();
        }
        let clock_after_priming = unsafe { (*group.inner.get()).clock };

        let (stack_idx, id_a, id_b) = {
            let inner = unsafe { &*group.inner.get() };
            let idx = inner
                .run_stacks
                .iter()
                .position(|s| s.members.len() > 1)
                .expect("packing two heavy cothreads per stack should force sharing");
            let members = &inner.run_stacks[idx].members;
            (idx, members[0], members[1])
        };
        let a = workers.iter().find(|w| w.id == id_a).unwrap();
        let b = workers.iter().find(|w| w.id == id_b).unwrap();

        let start_freq_cur = unsafe { (&(*group.inner.get()).run_stacks)[stack_idx].freq_cur() };
        let active = unsafe { (&(*group.inner.get()).run_stacks)[stack_idx].active };
        // Always target whichever of the pair isn't currently resident, so
        // every remaining send this round evicts the other one.
        let mut send_a_next = active == Some(id_b);

        let remaining = FREQ_UPDATE_PERIOD - clock_after_priming;
        for _ in 0..remaining {
            if send_a_next {
                main.send(a, Message::from_usize(0)).unwrap();
            } else {
                main.send(b, Message::from_usize(0)).unwrap();
            }
            send_a_next = !send_a_next;
        }

        let inner = unsafe { &*group.inner.get() };
        assert_eq!(inner.clock % FREQ_UPDATE_PERIOD, 0);
        assert_eq!(
            inner.run_stacks[stack_idx].freq_old(),
            start_freq_cur + remaining,
            "aging must snap the current-epoch swap count straight into the \
             prior-epoch slot, not average it with the previous prior value"
        );
        assert_eq!(inner.run_stacks[stack_idx].freq_cur(), 0);

        for w in workers {
            w.destroy();
        }
        group.destroy();
    }
}
