//! Application facade tying the document, the plug-in registry and the
//! analyzer together.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use core_address::Address;
use core_arch::{Architecture, PluginRegistry};
use core_config::Config;
use core_db::Database;
use core_document::{ControlFlowGraph, Document, StringEncoding};
use core_expr::{
    BackTrackContext, BackTrackVisitor, Expression, ExpressionVisitor, TrackContext, TrackVisitor,
};
use tracing::{info, warn};

use crate::{Analyzer, CancelToken};

pub struct Medusa {
    document: Arc<Document>,
    registry: PluginRegistry,
    analyzer: Analyzer,
    image: Vec<u8>,
    tasks: Mutex<Vec<(CancelToken, JoinHandle<()>)>>,
}

impl Medusa {
    /// The registry is provided by the application; nothing is discovered
    /// through globals.
    pub fn new(registry: PluginRegistry) -> Self {
        Self::with_config(registry, &Config::default())
    }

    pub fn with_config(registry: PluginRegistry, config: &Config) -> Self {
        Self {
            document: Arc::new(Document::with_history_capacity(
                config.file.document.history_capacity,
            )),
            registry,
            analyzer: Analyzer::from_config(&config.file.analyzer),
            image: Vec::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn is_opened(&self) -> bool {
        !self.image.is_empty()
    }

    /// Reads the file to disassemble.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        self.image = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        info!(target: "doc", path = %path.display(), bytes = self.image.len(), "image opened");
        Ok(())
    }

    pub fn open_bytes(&mut self, bytes: Vec<u8>) {
        self.image = bytes;
    }

    /// Maps the opened image through the first compatible loader and returns
    /// the entry point.
    pub fn load(&self) -> Result<Address> {
        let loader = self
            .registry
            .loader_for(&self.image)
            .ok_or_else(|| anyhow!("no loader accepts this image"))?;
        info!(target: "doc", loader = loader.name(), "mapping image");
        loader.map(&self.document, &self.image)?;
        loader
            .entry_point(&self.image)
            .ok_or_else(|| anyhow!("loader {} has no entry point", loader.name()))
    }

    /// Synchronous analysis from `entry`.
    pub fn analyze(&self, architecture: &Arc<dyn Architecture>, entry: Address) {
        let token = CancelToken::new();
        self.analyzer
            .analyze(&self.document, architecture, entry, &token);
    }

    /// Analysis on a background thread; the returned token cancels it.
    pub fn analyze_async(
        &self,
        architecture: Arc<dyn Architecture>,
        entry: Address,
    ) -> CancelToken {
        let token = CancelToken::new();
        let document = Arc::clone(&self.document);
        let analyzer = self.analyzer.clone();
        let thread_token = token.clone();
        let handle = std::thread::spawn(move || {
            analyzer.analyze(&document, &architecture, entry, &thread_token);
        });
        self.tasks
            .lock()
            .expect("task list")
            .push((token.clone(), handle));
        token
    }

    pub fn build_control_flow_graph(&self, entry: Address) -> ControlFlowGraph {
        self.analyzer.build_control_flow_graph(&self.document, entry)
    }

    pub fn create_function(&self, architecture: &Arc<dyn Architecture>, entry: Address) {
        self.analyzer
            .make_function(&self.document, architecture, &entry);
    }

    pub fn make_ascii_string(&self, addr: Address) -> bool {
        self.analyzer
            .make_string(&self.document, &addr, StringEncoding::Ascii)
    }

    pub fn make_utf16_string(&self, addr: Address) -> bool {
        self.analyzer
            .make_string(&self.document, &addr, StringEncoding::Utf16)
    }

    /// Rewrites the semantics of the instruction at `addr` with tracked
    /// identifiers, updating `context` with the definitions seen.
    pub fn track_operand(
        &self,
        addr: Address,
        context: &mut TrackContext,
    ) -> Vec<Expression> {
        let Some(cell) = self.document.cell(&addr) else {
            return Vec::new();
        };
        let Some(insn) = cell.as_instruction() else {
            return Vec::new();
        };
        let mut tracked = Vec::new();
        for expr in insn.semantics() {
            let mut visitor = TrackVisitor::new(addr, context);
            match visitor.visit(expr) {
                Ok(rewritten) => tracked.push(rewritten),
                Err(error) => warn!(target: "analyzer", %addr, %error, "track failed"),
            }
        }
        tracked
    }

    /// Whether the (already tracked) expressions of the instruction at
    /// `addr` define one of the identifiers watched by `context`.
    pub fn backtrack_operand(
        &self,
        addr: Address,
        context: &mut BackTrackContext,
        tracked: &[Expression],
    ) -> bool {
        let _ = addr;
        let mut hit = false;
        for expr in tracked {
            let mut visitor = BackTrackVisitor::new(context);
            if let Err(error) = visitor.visit(expr) {
                warn!(target: "analyzer", %error, "backtrack failed");
                continue;
            }
            hit |= visitor.result();
        }
        hit
    }

    /// Renders the cell at `addr` the way its architecture formats it.
    pub fn format_cell(&self, addr: &Address) -> Option<String> {
        let cell = self.document.cell(addr)?;
        match cell.as_instruction() {
            Some(insn) => {
                let arch = self
                    .registry
                    .architecture_by_tag(insn.data.architecture_tag)?;
                arch.format_instruction(&self.document, addr, insn).ok()
            }
            None => Some(format!("{} ({})", cell.kind(), cell.length())),
        }
    }

    /// Persists the document into `database`.
    pub fn save(&self, database: &mut dyn Database) -> Result<()> {
        core_db::save_document(database, &self.document)?;
        Ok(())
    }

    /// Restores `database` into the (empty) document.
    pub fn restore(&self, database: &mut dyn Database) -> Result<()> {
        core_db::load_document(database, &self.document)?;
        Ok(())
    }

    /// Cancels every background task, waits for them, and tears the
    /// document down.
    pub fn close(&mut self) {
        let tasks: Vec<_> = self.tasks.lock().expect("task list").drain(..).collect();
        for (token, _) in &tasks {
            token.cancel();
        }
        for (_, handle) in tasks {
            let _ = handle.join();
        }
        self.document.notify_quit();
        self.document.remove_all();
        self.image.clear();
        info!(target: "doc", "document closed");
    }
}

impl Drop for Medusa {
    fn drop(&mut self) {
        let tasks: Vec<_> = self.tasks.lock().expect("task list").drain(..).collect();
        for (token, _) in &tasks {
            token.cancel();
        }
        for (_, handle) in tasks {
            let _ = handle.join();
        }
    }
}
