//! The disassembly driver.
//!
//! Starting from an entry address, the analyzer decodes instructions through
//! the architecture back-end, follows branch and call targets resolved by
//! expression evaluation, maintains cross-references and labels, builds
//! functions and detects strings. Work items run on a small bounded pool;
//! one failing trace never aborts the whole analysis.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use core_address::Address;
use core_arch::Architecture;
use core_config::AnalyzerConfig;
use core_document::{
    BasicBlock, Cell, ControlFlowGraph, Document, EdgeKind, FunctionDetail, InstructionFlags,
    Label, MultiCell, MultiCellKind, StringEncoding, TaskStatus,
};
use core_emul::operand_reference;
use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

pub mod medusa;

pub use medusa::Medusa;

/// Cooperative cancellation flag checked between work items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
enum WorkItem {
    DisasmBb {
        addr: Address,
        mode: u8,
        /// Reached by falling through from a decoded instruction; only such
        /// items may stride over undecodable bytes.
        fallthrough: bool,
    },
    MakeFunc {
        addr: Address,
    },
    MakeString {
        addr: Address,
        encoding: StringEncoding,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    threads: usize,
    string_min_length: usize,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::from_config(&AnalyzerConfig::default())
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self {
            threads: config.effective_threads(),
            string_min_length: config.string_min_length,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Disassembles everything reachable from `entry`, blocking until the
    /// worklist drains or `token` fires.
    ///
    /// Disassembly items run on the pool; function and string items are
    /// deferred until the code they depend on has been committed, then run
    /// on the calling thread.
    pub fn analyze(
        &self,
        document: &Arc<Document>,
        architecture: &Arc<dyn Architecture>,
        entry: Address,
        token: &CancelToken,
    ) {
        let (tx, rx) = unbounded::<WorkItem>();
        let pending = AtomicUsize::new(1);
        tx.send(WorkItem::DisasmBb {
            addr: entry,
            mode: architecture.default_mode(&entry),
            fallthrough: false,
        })
        .expect("worklist open");

        let workers = self.threads.max(1);
        let deferred = std::sync::Mutex::new(Vec::new());
        document.notify_task("analyze", TaskStatus::Started);
        info!(target: "analyzer", %entry, workers, "analysis started");

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let tx = tx.clone();
                let pending = &pending;
                let deferred = &deferred;
                scope.spawn(move || {
                    while let Ok(item) = rx.recv() {
                        if matches!(item, WorkItem::Stop) {
                            break;
                        }
                        if !token.is_canceled() {
                            for new_item in self.process(document, architecture, item) {
                                match new_item {
                                    WorkItem::DisasmBb { .. } => {
                                        pending.fetch_add(1, Ordering::SeqCst);
                                        let _ = tx.send(new_item);
                                    }
                                    other => {
                                        deferred.lock().expect("deferred items").push(other)
                                    }
                                }
                            }
                        }
                        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                            for _ in 0..workers {
                                let _ = tx.send(WorkItem::Stop);
                            }
                        }
                    }
                });
            }
        });

        for item in deferred.into_inner().expect("deferred items") {
            if token.is_canceled() {
                break;
            }
            self.process(document, architecture, item);
        }

        let status = if token.is_canceled() {
            TaskStatus::Canceled
        } else {
            TaskStatus::Finished
        };
        document.notify_task("analyze", status);
        info!(target: "analyzer", ?status, "analysis ended");
    }

    fn process(
        &self,
        document: &Arc<Document>,
        architecture: &Arc<dyn Architecture>,
        item: WorkItem,
    ) -> Vec<WorkItem> {
        match item {
            WorkItem::DisasmBb {
                addr,
                mode,
                fallthrough,
            } => self.disassemble_at(document, architecture, addr, mode, fallthrough),
            WorkItem::MakeFunc { addr } => {
                self.make_function(document, architecture, &addr);
                Vec::new()
            }
            WorkItem::MakeString { addr, encoding } => {
                self.make_string(document, &addr, encoding);
                Vec::new()
            }
            WorkItem::Stop => Vec::new(),
        }
    }

    fn disassemble_at(
        &self,
        document: &Arc<Document>,
        architecture: &Arc<dyn Architecture>,
        addr: Address,
        mode: u8,
        fallthrough: bool,
    ) -> Vec<WorkItem> {
        if !document.is_mapped(&addr) {
            debug!(target: "analyzer", %addr, "trace left mapped memory");
            return Vec::new();
        }
        if document.contains_code(&addr) {
            return Vec::new();
        }
        let Ok(bytes) = document.read_memory_upto(&addr, architecture.max_instruction_length())
        else {
            return Vec::new();
        };

        let insn = match architecture.disassemble(&bytes, &addr, mode) {
            Ok(insn) => insn,
            Err(error) => {
                debug!(target: "analyzer", %addr, %error, "decode failed");
                let _ = document.set_cell(&addr, Cell::unknown(), false);
                // Only keep striding over bytes when a decoded instruction
                // led here; never blindly walk through data.
                if fallthrough {
                    return vec![WorkItem::DisasmBb {
                        addr: addr.move_by(1),
                        mode,
                        fallthrough: true,
                    }];
                }
                return Vec::new();
            }
        };

        let length = insn.length();
        let flow = insn.flow;
        if let Err(error) = document.set_cell(&addr, Cell::instruction(insn.clone()), false) {
            debug!(target: "analyzer", %addr, %error, "conflicting cell, trace stopped");
            return Vec::new();
        }

        let mut out = Vec::new();
        let is_branch =
            flow.contains(InstructionFlags::JUMP) || flow.contains(InstructionFlags::CALL);
        if is_branch {
            for index in 0..insn.operands().len() {
                let Some(target) = operand_reference(
                    document,
                    &insn,
                    index,
                    &addr,
                    &architecture.cpu_information(),
                ) else {
                    continue;
                };
                if target == addr || !document.is_mapped(&target) {
                    continue;
                }
                document.add_cross_reference(target, addr);
                out.push(WorkItem::DisasmBb {
                    addr: target,
                    mode: architecture.default_mode(&target),
                    fallthrough: false,
                });
                if flow.contains(InstructionFlags::CALL) {
                    out.push(WorkItem::MakeFunc { addr: target });
                }
            }
        } else {
            // Data uses: a dereferenced memory operand with a constant
            // location is remembered and probed for a string.
            for operand in insn.operands() {
                let core_expr::Expression::Mem {
                    offset,
                    dereference: true,
                    ..
                } = operand
                else {
                    continue;
                };
                let core_expr::Expression::Const { value, .. } = offset.as_ref() else {
                    continue;
                };
                let target = Address::flat(*value);
                if target == addr || !document.contains_unknown(&target) {
                    continue;
                }
                document.add_cross_reference(target, addr);
                out.push(WorkItem::MakeString {
                    addr: target,
                    encoding: StringEncoding::Ascii,
                });
            }
        }

        if !flow.contains(InstructionFlags::RETURN)
            && !(flow.contains(InstructionFlags::JUMP)
                && !flow.contains(InstructionFlags::CONDITIONAL))
        {
            out.push(WorkItem::DisasmBb {
                addr: addr.move_by(length as i64),
                mode,
                fallthrough: true,
            });
        }
        out
    }

    /// Builds the control-flow graph reachable from `entry` by following
    /// committed instruction cells and their recorded branch targets.
    pub fn build_control_flow_graph(
        &self,
        document: &Document,
        entry: Address,
    ) -> ControlFlowGraph {
        const INSTRUCTION_BUDGET: usize = 65_536;

        let mut cfg = ControlFlowGraph::new();
        let mut blocks: Vec<(BasicBlock, Vec<(Address, EdgeKind)>)> = Vec::new();
        let mut pending = vec![entry];
        let mut seen = std::collections::BTreeSet::new();
        let mut budget = INSTRUCTION_BUDGET;

        while let Some(start) = pending.pop() {
            if !seen.insert(start) {
                continue;
            }
            let mut at = start;
            let mut last = start;
            let mut successors = Vec::new();
            loop {
                if budget == 0 {
                    warn!(target: "analyzer", %entry, "instruction budget exhausted");
                    break;
                }
                budget -= 1;
                let Some(cell) = document.cell(&at) else { break };
                let Some(insn) = cell.as_instruction() else { break };
                last = at;
                let next = at.move_by(insn.length() as i64);
                if insn.flow.contains(InstructionFlags::RETURN) {
                    break;
                }
                if insn.flow.contains(InstructionFlags::JUMP) {
                    if let Some(target) = document.cross_reference_to(&at) {
                        if insn.flow.contains(InstructionFlags::CONDITIONAL) {
                            successors.push((target, EdgeKind::Taken));
                            successors.push((next, EdgeKind::NotTaken));
                        } else {
                            successors.push((target, EdgeKind::Unconditional));
                        }
                    } else if insn.flow.contains(InstructionFlags::CONDITIONAL) {
                        // Indirect conditional branch: only fall-through known.
                        successors.push((next, EdgeKind::NotTaken));
                    }
                    break;
                }
                at = next;
            }
            for (target, _) in &successors {
                pending.push(*target);
            }
            blocks.push((BasicBlock { first: start, last }, successors));
        }

        for (block, _) in &blocks {
            cfg.add_block(*block);
        }
        for (block, successors) in &blocks {
            let Some(from) = cfg.block_index(&block.first) else { continue };
            for (target, kind) in successors {
                if let Some(to) = cfg.block_index(target) {
                    cfg.add_edge(from, to, *kind);
                }
            }
        }
        cfg
    }

    /// Creates the Function multi-cell, label and detail record for the code
    /// reachable from `entry`. Idempotent.
    pub fn make_function(
        &self,
        document: &Arc<Document>,
        _architecture: &Arc<dyn Architecture>,
        entry: &Address,
    ) {
        if document
            .multi_cell(entry)
            .is_some_and(|mc| mc.kind == MultiCellKind::Function)
        {
            return;
        }
        if !document.contains_code(entry) {
            debug!(target: "analyzer", addr = %entry, "function entry without code");
            return;
        }

        let cfg = self.build_control_flow_graph(document, *entry);
        let Some((_, last)) = cfg.extent() else { return };
        let last_length = document
            .cell(&last)
            .map(|c| c.length() as u64)
            .unwrap_or(1);
        let size = last
            .offset()
            .saturating_sub(entry.offset())
            .saturating_add(last_length);

        let name = document
            .label_at(entry)
            .map(|l| l.name().to_owned())
            .unwrap_or_else(|| format!("fcn_{:x}", entry.offset()));
        let mut detail = FunctionDetail::new(&name);
        detail.control_flow_graph = cfg;
        let id = detail.id();
        document.set_function_detail(id, detail);
        document.bind_detail_id(*entry, 0, id);

        let _ = document.set_multi_cell(
            entry,
            MultiCell::new(MultiCellKind::Function, size).with_detail(id),
            false,
        );
        let _ = document.add_label(entry, Label::function(&name), false);
        info!(target: "analyzer", addr = %entry, %name, size, "function created");
    }

    /// String heuristic: a terminated printable run of at least the
    /// configured length becomes a string.
    pub fn make_string(
        &self,
        document: &Arc<Document>,
        addr: &Address,
        encoding: StringEncoding,
    ) -> bool {
        const MAX_STRING: usize = 4096;
        match document.scan_string(addr, encoding, MAX_STRING) {
            Ok((text, true)) if text.chars().count() >= self.string_min_length => {
                document.make_string(addr, encoding, MAX_STRING).is_ok()
            }
            Ok(_) => false,
            Err(error) => {
                debug!(target: "analyzer", %addr, %error, "string probe failed");
                false
            }
        }
    }
}
