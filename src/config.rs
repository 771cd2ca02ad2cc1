use crate::error::Corruption;

/// Called once for every detected corruption.
///
/// The handler decides whether to log and continue or to stop the system,
/// for instance by panicking.
pub type CorruptionHandler = fn(&Corruption);

/// Default handler: reports through the `log` facade and continues.
pub fn log_corruption(corruption: &Corruption) {
  log::error!("heap corruption: {corruption}");
}

/// How `allocate` picks a free block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
  /// Smallest block that fits; ties go to the earliest in free-list order.
  #[default]
  BestFit,
  /// First block in free-list order that fits.
  FirstFit,
}

/// Width of the exact-length field stored in front of a poisoned payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LenWidth {
  U8,
  #[default]
  U16,
  U32,
}

impl LenWidth {
  pub const fn bytes(self) -> usize {
    match self {
      LenWidth::U8 => 1,
      LenWidth::U16 => 2,
      LenWidth::U32 => 4,
    }
  }

  /// Largest total poisoned size the field can record.
  pub const fn max(self) -> usize {
    match self {
      LenWidth::U8 => u8::MAX as usize,
      LenWidth::U16 => u16::MAX as usize,
      LenWidth::U32 => u32::MAX as usize,
    }
  }
}

/// Guard geometry of the poisoning layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoisonConfig {
  /// Guard bytes in front of the payload.
  pub before: usize,
  /// Guard bytes after the payload.
  pub after: usize,
  pub len_width: LenWidth,
}

impl PoisonConfig {
  pub const fn new() -> Self {
    Self {
      before: 6,
      after: 6,
      len_width: LenWidth::U16,
    }
  }

  /// Extra bytes each poisoned allocation costs.
  pub const fn overhead(&self) -> usize {
    self.len_width.bytes() + self.before + self.after
  }

  /// Distance from the block payload to the pointer handed to the caller.
  pub const fn offset(&self) -> usize {
    self.len_width.bytes() + self.before
  }
}

impl Default for PoisonConfig {
  fn default() -> Self {
    Self::new()
  }
}

/// Feature selection for a heap, fixed when the heap is built.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
  pub strategy: FitStrategy,
  /// Enables the on-demand heap walker and the metric queries.
  pub info: bool,
  /// Keeps free-block counters up to date on every mutation.
  pub inline_metrics: bool,
  /// Runs the integrity checker before and after every mutation.
  pub integrity_check: bool,
  /// Guard bytes for the `poison_*` entry points; `None` disables them.
  pub poison: Option<PoisonConfig>,
  /// Emits `log` records from inside heap operations. Must be off when the
  /// installed logger allocates from this same heap.
  pub logging: bool,
  pub on_corruption: CorruptionHandler,
}

impl HeapConfig {
  pub const fn new() -> Self {
    Self {
      strategy: FitStrategy::BestFit,
      info: false,
      inline_metrics: false,
      integrity_check: false,
      poison: None,
      logging: true,
      on_corruption: log_corruption,
    }
  }

  pub const fn strategy(
    mut self,
    strategy: FitStrategy,
  ) -> Self {
    self.strategy = strategy;
    self
  }

  pub const fn info(
    mut self,
    enabled: bool,
  ) -> Self {
    self.info = enabled;
    self
  }

  /// Inline metrics are only readable through the info queries, so turning
  /// them on also turns on `info`.
  pub const fn inline_metrics(
    mut self,
    enabled: bool,
  ) -> Self {
    self.inline_metrics = enabled;
    if enabled {
      self.info = true;
    }
    self
  }

  pub const fn integrity_check(
    mut self,
    enabled: bool,
  ) -> Self {
    self.integrity_check = enabled;
    self
  }

  pub const fn poison(
    mut self,
    poison: Option<PoisonConfig>,
  ) -> Self {
    self.poison = poison;
    self
  }

  pub const fn logging(
    mut self,
    enabled: bool,
  ) -> Self {
    self.logging = enabled;
    self
  }

  pub const fn on_corruption(
    mut self,
    handler: CorruptionHandler,
  ) -> Self {
    self.on_corruption = handler;
    self
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}
