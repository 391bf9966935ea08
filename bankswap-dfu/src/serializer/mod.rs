// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash access serializer.
//!
//! Every non-volatile write in the engine is queued here. Requests run one
//! at a time in FIFO order and at most one raw driver operation is in flight.
//! Completions are delivered to the listener of the module that owns the
//! handle, after the serializer has released all of its internal borrows,
//! so a listener may enqueue further requests from its callback.

mod job;
pub mod swap;

use core::cell::{Cell, RefCell};

use heapless::{Deque, Vec};

use self::job::{Job, Recovery};
use crate::error::{FlashError, FlashFault};
use crate::flash::FlashDriver;
use crate::layout::{FlashLayout, MAX_PAGE_SIZE, WORD_SIZE};

/// Maximum number of queued requests, including the one in flight.
pub const QUEUE_DEPTH: usize = 8;

/// Maximum number of registered modules.
pub const MAX_MODULES: usize = 6;

/// Largest payload of a single store or update request.
pub const MAX_PAYLOAD_BYTES: usize = 1024;

const MAX_PAYLOAD_WORDS: usize = MAX_PAYLOAD_BYTES / WORD_SIZE as usize;
const MAX_PAGE_WORDS: usize = (MAX_PAGE_SIZE / WORD_SIZE) as usize;

/// Index of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleId(u8);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque reference to a flash block owned by a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHandle {
    module: ModuleId,
    address: u32,
}

impl BlockHandle {
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Absolute flash address of the block.
    pub fn address(&self) -> u32 {
        self.address
    }
}

/// How a module's flash region is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterParams {
    /// `block_count` blocks carved from the storage region, page aligned.
    Blocks { block_size: u32, block_count: u32 },
    /// A fixed absolute region, split into blocks of `block_size`.
    Raw { start: u32, size: u32, block_size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    Store,
    Update,
    Clear,
}

/// Outcome of one request, delivered to the owning module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub handle: BlockHandle,
    pub opcode: Opcode,
    /// Offset relative to `handle`.
    pub offset: u32,
    pub size: u32,
    pub result: Result<(), FlashError>,
}

pub trait FlashListener {
    fn on_flash_complete(&self, completion: &Completion);

    /// The swap area has been cleaned up after an interrupted rewrite, so
    /// flash contents read from now on are consistent.
    fn on_flash_ready(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct ModuleSlot {
    start: u32,
    /// Bounds of the region. Page rounded for storage allocations.
    size: u32,
    block_size: u32,
    block_count: u32,
}

impl ModuleSlot {
    fn contains(&self, address: u32, size: u32) -> bool {
        address >= self.start
            && address
                .checked_add(size)
                .is_some_and(|end| end <= self.start + self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Store,
    Update,
    Clear,
    /// Internal swap-area recovery, not owned by any module.
    Recover,
}

pub(crate) struct FlashRequest {
    op: Op,
    handle: Option<BlockHandle>,
    address: u32,
    offset: u32,
    size: u32,
    payload: Vec<u32, MAX_PAYLOAD_WORDS>,
}

impl FlashRequest {
    fn recover() -> Self {
        Self {
            op: Op::Recover,
            handle: None,
            address: 0,
            offset: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    fn completion(&self, result: Result<(), FlashError>) -> Option<Completion> {
        let opcode = match self.op {
            Op::Store => Opcode::Store,
            Op::Update => Opcode::Update,
            Op::Clear => Opcode::Clear,
            Op::Recover => return None,
        };
        Some(Completion {
            handle: self.handle?,
            opcode,
            offset: self.offset,
            size: self.size,
            result,
        })
    }
}

struct Inner {
    initialized: bool,
    modules: [Option<ModuleSlot>; MAX_MODULES],
    storage_cursor: u32,
    /// The front request is the one in progress while `active` is set.
    queue: Deque<FlashRequest, QUEUE_DEPTH>,
    active: Option<Job>,
}

impl Inner {
    fn slot(&self, handle: BlockHandle) -> Result<ModuleSlot, FlashError> {
        let slot = self
            .modules
            .get(handle.module.index())
            .copied()
            .flatten()
            .ok_or(FlashError::InvalidParam)?;
        if handle.address < slot.start || handle.address >= slot.start + slot.size {
            return Err(FlashError::InvalidParam);
        }
        Ok(slot)
    }
}

pub struct Serializer<'a, D: FlashDriver> {
    layout: FlashLayout,
    driver: RefCell<D>,
    inner: RefCell<Inner>,
    scratch: RefCell<[u32; MAX_PAGE_WORDS]>,
    listeners: [Cell<Option<&'a dyn FlashListener>>; MAX_MODULES],
}

impl<'a, D: FlashDriver> Serializer<'a, D> {
    pub fn new(driver: D, layout: FlashLayout) -> Self {
        Self {
            layout,
            driver: RefCell::new(driver),
            inner: RefCell::new(Inner {
                initialized: false,
                modules: [None; MAX_MODULES],
                storage_cursor: layout.storage_start,
                queue: Deque::new(),
                active: None,
            }),
            scratch: RefCell::new([0; MAX_PAGE_WORDS]),
            listeners: core::array::from_fn(|_| Cell::new(None)),
        }
    }

    /// Validate the layout and schedule recovery of an interrupted swap.
    ///
    /// The recovery is queued ahead of every module request.
    pub fn init(&self) -> Result<(), FlashError> {
        if let Err(err) = self.layout.validate() {
            error!("invalid flash layout: {}", err);
            return Err(FlashError::InvalidParam);
        }

        {
            let mut inner = self.inner.borrow_mut();
            if inner.initialized {
                return Ok(());
            }
            inner.initialized = true;

            let dirty = Recovery::plan(&*self.driver.borrow(), &self.layout).is_some();
            if dirty {
                warn!("swap area dirty at init, recovery scheduled");
                inner
                    .queue
                    .push_front(FlashRequest::recover())
                    .map_err(|_| FlashError::QueueFull)?;
            }
        }

        self.kick();
        Ok(())
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Register a module and return the handle of its first block.
    pub fn register(
        &self,
        params: RegisterParams,
        listener: &'a dyn FlashListener,
    ) -> Result<BlockHandle, FlashError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.initialized {
            return Err(FlashError::InvalidState);
        }
        let index = inner
            .modules
            .iter()
            .position(Option::is_none)
            .ok_or(FlashError::NoSpace)?;

        let slot = match params {
            RegisterParams::Blocks {
                block_size,
                block_count,
            } => {
                if block_size == 0 || block_count == 0 || block_size % WORD_SIZE != 0 {
                    return Err(FlashError::InvalidParam);
                }
                let size = block_size
                    .checked_mul(block_count)
                    .ok_or(FlashError::InvalidParam)?;
                let rounded = self.layout.page_span(size).ok_or(FlashError::NoSpace)?;
                let start = inner.storage_cursor;
                let storage_end = self.layout.storage_start + self.layout.storage_size;
                if start.checked_add(rounded).map_or(true, |end| end > storage_end) {
                    return Err(FlashError::NoSpace);
                }
                inner.storage_cursor = start + rounded;
                ModuleSlot {
                    start,
                    size: rounded,
                    block_size,
                    block_count,
                }
            }
            RegisterParams::Raw {
                start,
                size,
                block_size,
            } => {
                let aligned = [start, size, block_size].iter().all(|v| v % WORD_SIZE == 0);
                if size == 0 || block_size == 0 || !aligned {
                    return Err(FlashError::InvalidParam);
                }
                if start
                    .checked_add(size)
                    .map_or(true, |end| end > self.layout.flash_size)
                    || self.layout.overlaps_reserved(start, size)
                {
                    return Err(FlashError::InvalidParam);
                }
                ModuleSlot {
                    start,
                    size,
                    block_size,
                    block_count: size.div_ceil(block_size),
                }
            }
        };

        inner.modules[index] = Some(slot);
        self.listeners[index].set(Some(listener));
        debug!(
            "module {} registered at {=u32:#x} ({=u32} bytes)",
            index, slot.start, slot.size
        );
        Ok(BlockHandle {
            module: ModuleId(index as u8),
            address: slot.start,
        })
    }

    /// Handle of block `index` of the module owning `base`.
    pub fn block(&self, base: BlockHandle, index: u32) -> Result<BlockHandle, FlashError> {
        let slot = self.inner.borrow().slot(base)?;
        if index >= slot.block_count {
            return Err(FlashError::InvalidParam);
        }
        Ok(BlockHandle {
            module: base.module,
            address: slot.start + index * slot.block_size,
        })
    }

    /// Queue a write of `data` to erased flash at `handle + offset`.
    pub fn store(&self, handle: BlockHandle, data: &[u8], offset: u32) -> Result<(), FlashError> {
        self.enqueue_write(Op::Store, handle, data, offset)
    }

    /// Queue an in-place rewrite of `handle + offset`. Words of the touched
    /// pages outside the range are preserved.
    pub fn update(&self, handle: BlockHandle, data: &[u8], offset: u32) -> Result<(), FlashError> {
        self.enqueue_write(Op::Update, handle, data, offset)
    }

    /// Queue the erase of the pages covering `size` bytes from the page
    /// aligned `handle`.
    pub fn clear(&self, handle: BlockHandle, size: u32) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.initialized {
            return Err(FlashError::InvalidState);
        }
        let slot = inner.slot(handle)?;
        if size == 0 || size % WORD_SIZE != 0 || !self.layout.is_page_aligned(handle.address) {
            return Err(FlashError::InvalidParam);
        }
        let span = self.layout.page_span(size).ok_or(FlashError::InvalidParam)?;
        if !slot.contains(handle.address, span) {
            return Err(FlashError::InvalidParam);
        }
        if inner.queue.is_full() {
            return Err(FlashError::QueueFull);
        }

        let request = FlashRequest {
            op: Op::Clear,
            handle: Some(handle),
            address: handle.address,
            offset: 0,
            size,
            payload: Vec::new(),
        };
        inner
            .queue
            .push_back(request)
            .map_err(|_| FlashError::QueueFull)?;
        drop(inner);

        self.kick();
        Ok(())
    }

    fn enqueue_write(
        &self,
        op: Op,
        handle: BlockHandle,
        data: &[u8],
        offset: u32,
    ) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.initialized {
            return Err(FlashError::InvalidState);
        }
        if data.is_empty() {
            return Err(FlashError::NullArgument);
        }
        let slot = inner.slot(handle)?;
        if data.len() > MAX_PAYLOAD_BYTES
            || data.len() % WORD_SIZE as usize != 0
            || offset % WORD_SIZE != 0
        {
            return Err(FlashError::InvalidParam);
        }
        let size = data.len() as u32;
        let address = handle
            .address
            .checked_add(offset)
            .ok_or(FlashError::InvalidParam)?;
        if !slot.contains(address, size) {
            return Err(FlashError::InvalidParam);
        }
        if inner.queue.is_full() {
            trace!("queue full, rejecting request for {=u32:#x}", address);
            return Err(FlashError::QueueFull);
        }

        let mut payload = Vec::new();
        for chunk in data.chunks_exact(WORD_SIZE as usize) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            payload.push(word).map_err(|_| FlashError::InvalidParam)?;
        }

        let request = FlashRequest {
            op,
            handle: Some(handle),
            address,
            offset,
            size,
            payload,
        };
        inner
            .queue
            .push_back(request)
            .map_err(|_| FlashError::QueueFull)?;
        drop(inner);

        self.kick();
        Ok(())
    }

    /// Completion of the driver operation in flight.
    ///
    /// Must be called on the same execution context as every other method.
    pub fn on_flash_event(&self, result: Result<(), FlashFault>) {
        let finished = {
            let mut inner = self.inner.borrow_mut();
            let Some(job) = inner.active.take() else {
                warn!("flash event without an operation in flight");
                return;
            };

            let outcome = match result {
                Ok(()) => match inner.queue.front() {
                    Some(request) => {
                        let mut driver = self.driver.borrow_mut();
                        let mut scratch = self.scratch.borrow_mut();
                        Ok(job.advance(request, &self.layout, &mut *driver, &mut scratch[..]))
                    }
                    None => Ok(None),
                },
                Err(fault) => Err((fault, job.touches_swap_area())),
            };

            match outcome {
                Ok(Some(next)) => {
                    inner.active = Some(next);
                    None
                }
                Ok(None) => inner.queue.pop_front().map(|request| (request, Ok(()))),
                Err((fault, dirty)) => {
                    error!("flash operation failed: {}", fault);
                    let request = inner.queue.pop_front();
                    let was_recovery = request.as_ref().is_some_and(|r| r.op == Op::Recover);
                    if dirty
                        && !was_recovery
                        && inner.queue.push_front(FlashRequest::recover()).is_err()
                    {
                        error!("no room to schedule swap recovery");
                    }
                    request.map(|request| (request, Err(FlashError::Hardware(fault))))
                }
            }
        };

        if let Some((request, result)) = finished {
            match request.completion(result) {
                Some(completion) => self.notify(&completion),
                None => {
                    info!("swap area recovery finished: {}", result.is_ok());
                    self.notify_ready();
                }
            }
        }

        self.kick();
    }

    fn notify_ready(&self) {
        for listener in self.listeners.iter().filter_map(Cell::get) {
            listener.on_flash_ready();
        }
    }

    fn notify(&self, completion: &Completion) {
        let listener = self
            .listeners
            .get(completion.handle.module.index())
            .and_then(Cell::get);
        match listener {
            Some(listener) => listener.on_flash_complete(completion),
            None => warn!("completion for unregistered module {}", completion.handle.module),
        }
    }

    /// Start the front request when nothing is in flight.
    fn kick(&self) {
        if self.start_next() {
            info!("swap area already clean");
            self.notify_ready();
        }
    }

    /// Returns whether a recovery request was dropped with nothing to do.
    fn start_next(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !inner.initialized {
            return false;
        }
        let mut driver = self.driver.borrow_mut();
        let mut scratch = self.scratch.borrow_mut();

        let mut recovered = false;
        while inner.active.is_none() {
            let Some(request) = inner.queue.front() else {
                break;
            };
            match Job::start(request, &self.layout, &mut *driver, &mut scratch[..]) {
                Some(job) => inner.active = Some(job),
                None => {
                    recovered |= inner.queue.pop_front().is_some_and(|r| r.op == Op::Recover);
                }
            }
        }
        recovered
    }

    /// Whether a swap area recovery is queued or running. Flash read while
    /// this holds may show a half-rewritten page.
    pub fn is_recovering(&self) -> bool {
        self.inner
            .borrow()
            .queue
            .iter()
            .any(|request| request.op == Op::Recover)
    }

    /// Read flash directly, bypassing the queue.
    pub fn read(&self, address: u32, buf: &mut [u8]) {
        self.driver.borrow().read(address, buf);
    }

    pub fn read_word(&self, address: u32) -> u32 {
        self.driver.borrow().read_word(address)
    }

    /// Number of queued requests, including the one in progress.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.queue.is_empty() && inner.active.is_none()
    }

    /// Run `f` with exclusive access to the driver.
    ///
    /// `f` must not call back into the serializer.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.driver.borrow_mut())
    }
}
