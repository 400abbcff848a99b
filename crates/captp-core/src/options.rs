use std::fmt;
use std::rc::Rc;

use crate::error::CapTpError;
use crate::marshal::{JsonMarshal, Marshal};
use crate::slot::Slot;
use crate::tables::{ImportExportTables, TableOptions, TablesFactory};
use crate::trap::{TrapGuest, TrapHost};
use crate::value::Value;

/// Called once for every fault the engine swallows: a message that could
/// not be handled, a failed send, the reason a connection went down.
pub type RejectHook = Rc<dyn Fn(&CapTpError)>;

/// Called with a value and the slot it was just assigned.
pub type SlotHook = Rc<dyn Fn(&Value, Slot)>;

/// Options for [`CapTp::new`](crate::CapTp::new).
///
/// ```ignore
/// let options = CapTpOptions::default()
///     .epoch(3)
///     .gc_imports(true)
///     .on_reject(|err| eprintln!("captp: {err}"));
/// ```
#[derive(Clone)]
pub struct CapTpOptions {
    /// Tag carried by every message; messages with another epoch are
    /// discarded.
    pub epoch: u64,
    /// Release imports the application no longer references, and tell the
    /// peer. Off by default: imports are then kept for the life of the
    /// connection.
    pub gc_imports: bool,
    /// Defaults to logging with `tracing::warn!`.
    pub on_reject: Option<RejectHook>,
    pub export_hook: Option<SlotHook>,
    pub import_hook: Option<SlotHook>,
    /// Serve trap calls on handlers made with `make_trap_handler`.
    pub trap_host: Option<Rc<dyn TrapHost>>,
    /// Allow this side to make trap calls. Exclusive with `trap_host`.
    pub trap_guest: Option<Rc<dyn TrapGuest>>,
    pub marshal: Rc<dyn Marshal>,
    /// Where imports and exports are kept. Defaults to
    /// [`DefaultTables`](crate::DefaultTables).
    pub import_export_tables: Option<TablesFactory>,
}

impl Default for CapTpOptions {
    fn default() -> Self {
        Self {
            epoch: 0,
            gc_imports: false,
            on_reject: None,
            export_hook: None,
            import_hook: None,
            trap_host: None,
            trap_guest: None,
            marshal: Rc::new(JsonMarshal),
            import_export_tables: None,
        }
    }
}

impl CapTpOptions {
    pub fn epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn gc_imports(mut self, gc_imports: bool) -> Self {
        self.gc_imports = gc_imports;
        self
    }

    pub fn on_reject(mut self, hook: impl Fn(&CapTpError) + 'static) -> Self {
        self.on_reject = Some(Rc::new(hook));
        self
    }

    pub fn export_hook(mut self, hook: impl Fn(&Value, Slot) + 'static) -> Self {
        self.export_hook = Some(Rc::new(hook));
        self
    }

    pub fn import_hook(mut self, hook: impl Fn(&Value, Slot) + 'static) -> Self {
        self.import_hook = Some(Rc::new(hook));
        self
    }

    pub fn trap_host(mut self, host: impl TrapHost + 'static) -> Self {
        self.trap_host = Some(Rc::new(host));
        self
    }

    pub fn trap_guest(mut self, guest: impl TrapGuest + 'static) -> Self {
        self.trap_guest = Some(Rc::new(guest));
        self
    }

    pub fn marshal(mut self, marshal: impl Marshal + 'static) -> Self {
        self.marshal = Rc::new(marshal);
        self
    }

    pub fn import_export_tables(
        mut self,
        make: impl Fn(TableOptions) -> Box<dyn ImportExportTables> + 'static,
    ) -> Self {
        self.import_export_tables = Some(Rc::new(make));
        self
    }
}

impl fmt::Debug for CapTpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapTpOptions")
            .field("epoch", &self.epoch)
            .field("gc_imports", &self.gc_imports)
            .field("on_reject", &self.on_reject.is_some())
            .field("export_hook", &self.export_hook.is_some())
            .field("import_hook", &self.import_hook.is_some())
            .field("trap_host", &self.trap_host.is_some())
            .field("trap_guest", &self.trap_guest.is_some())
            .field("import_export_tables", &self.import_export_tables.is_some())
            .finish_non_exhaustive()
    }
}
