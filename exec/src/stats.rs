use std::fmt;

/// Per-vCPU execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Units dispatched.
    pub executed: u64,
    /// Key resolutions (hint dispatches excluded).
    pub lookups: u64,
    pub jc_hits: u64,
    pub ht_hits: u64,
    pub translations: u64,
    /// Successor links installed.
    pub links: u64,
    /// Dispatches that skipped resolution through a linked slot.
    pub linked_dispatches: u64,
    pub interrupts: u64,
    pub exceptions: u64,
    /// Unwinds out of running units.
    pub unwinds: u64,
    pub idle_waits: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |n: u64| {
            if self.lookups == 0 {
                0.0
            } else {
                n as f64 * 100.0 / self.lookups as f64
            }
        };
        writeln!(f, "exec stats:")?;
        writeln!(f, "  executed          {}", self.executed)?;
        writeln!(f, "  lookups           {}", self.lookups)?;
        writeln!(f, "    jump cache hit  {} ({:.1}%)", self.jc_hits, pct(self.jc_hits))?;
        writeln!(f, "    hash table hit  {} ({:.1}%)", self.ht_hits, pct(self.ht_hits))?;
        writeln!(f, "    translated      {}", self.translations)?;
        writeln!(f, "  links             {}", self.links)?;
        writeln!(f, "  linked dispatch   {}", self.linked_dispatches)?;
        writeln!(f, "  interrupts        {}", self.interrupts)?;
        writeln!(f, "  exceptions        {}", self.exceptions)?;
        writeln!(f, "  unwinds           {}", self.unwinds)?;
        writeln!(f, "  idle waits        {}", self.idle_waits)
    }
}
