//! The 16 legacy ISA interrupt sources.
//!
//! The default mapping of ISA lines to global IRQ numbers is 1:1, and ISA
//! interrupts are edge-triggered and active-high unless an ACPI interrupt
//! source override says otherwise. Overrides are applied by the ACPI layer
//! before the tuples are consumed; the table itself is read-only after
//! `init`.

use spin::Once;

/// Number of legacy ISA interrupt lines.
pub const ISA_INTR_LINES: usize = 16;

/// Electrical polarity of an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    High,
    Low,
}

/// Trigger mode of an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// An interrupt source: the global IRQ number plus how the line signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqTuple {
    pub irq: u8,
    pub polarity: Polarity,
    pub trigger: Trigger,
}

static ISA_IRQS: Once<[IrqTuple; ISA_INTR_LINES]> = Once::new();

/// Populates the table with the 1:1 edge/high defaults.
pub fn init() {
    ISA_IRQS.call_once(|| {
        core::array::from_fn(|line| IrqTuple {
            irq: line as u8,
            polarity: Polarity::High,
            trigger: Trigger::Edge,
        })
    });
}

/// Returns the tuple for an ISA line. The reference outlives every
/// consumer; the storage is process-wide.
///
/// Panics for `line >= 16` — that is a caller bug, not a runtime
/// condition.
pub fn irq(line: u8) -> &'static IrqTuple {
    if line as usize >= ISA_INTR_LINES {
        panic!("invalid ISA interrupt line {}", line);
    }
    &ISA_IRQS.get().expect("ISA interrupt table not initialized")[line as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_one_to_one_edge_high() {
        init();
        let tuple = irq(3);
        assert_eq!(tuple.irq, 3);
        assert_eq!(tuple.polarity, Polarity::High);
        assert_eq!(tuple.trigger, Trigger::Edge);
    }

    #[test]
    fn last_line_is_valid() {
        init();
        assert_eq!(irq(15).irq, 15);
    }

    #[test]
    #[should_panic(expected = "invalid ISA interrupt line")]
    fn line_16_panics() {
        init();
        let _ = irq(16);
    }
}
