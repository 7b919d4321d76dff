//! Calibrated busy-wait loops and I²C bus timing derivation.
//!
//! The engines never sleep; the only waiting they do is at clock-cell
//! granularity (bit-banged transfers) or for the bus-free time after a STOP
//! condition. Both are produced by [`loop3`], a three-cycles-per-iteration
//! delay loop, with iteration counts derived from the configured CPU clock
//! and the I²C specification figures for the selected [`Mode`].

use fugit::HertzU32;

use crate::i2c::Mode;

/// Runs `count` iterations of a three-cycle busy loop, delaying for
/// approximately `count * 3 / f_cpu` seconds.
///
/// A `count` of zero delays for 256 iterations. On non-AVR targets this is a
/// plain spin loop with no timing guarantee; it only exists so that the
/// engines can be exercised in host tests.
#[inline(always)]
pub fn loop3(count: u8) {
    #[cfg(target_arch = "avr")]
    unsafe {
        core::arch::asm!(
            "1: dec {0}",
            "brne 1b",
            inout(reg) count => _,
            options(nomem, nostack),
        );
    }
    #[cfg(not(target_arch = "avr"))]
    {
        for _ in 0..count {
            core::hint::spin_loop();
        }
    }
}

/// Computes the [`loop3`] count for a delay given in tenths of a
/// microsecond, rounding up.
///
/// The result is clamped to `1..=255` so a requested delay never degenerates
/// to the 256-iteration wrap-around of a zero count.
pub const fn loop3_count(tenths_us: u32, cpu: HertzU32) -> u8 {
    let cycles = tenths_us as u64 * cpu.raw() as u64;
    // one iteration is 3 cycles, one tenth of a µs is 1e-7 s
    let count = cycles.div_ceil(30_000_000);
    if count == 0 {
        1
    } else if count > 255 {
        255
    } else {
        count as u8
    }
}

/// Computes the TWI bitrate register value for the requested SCL frequency,
/// assuming a prescaler of one: `(f_cpu / f_scl - 16) / 2`.
///
/// Returns `None` when the CPU clock is too slow to reach the requested
/// frequency at all.
pub const fn twi_bitrate(mode: Mode, cpu: HertzU32) -> Option<u8> {
    let divided = cpu.raw() / mode.scl_frequency().raw();
    if divided <= 16 {
        return None;
    }
    let bitrate = (divided - 16) / 2;
    if bitrate > 255 {
        Some(255)
    } else {
        Some(bitrate as u8)
    }
}

/// Per-mode I²C timing figures, expressed as [`loop3`] iteration counts.
///
/// The fields follow the naming of the I²C bus specification: START
/// hold/setup, SCL low/high half-periods, STOP setup, and bus-free time.
/// `stop_hold` is the quiet time observed after every STOP before the next
/// START may be issued (t_SU;STO + t_BUF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timings {
    /// START condition hold time (t_HD;STA).
    pub hd_sta: u8,
    /// SCL low half-period (t_LOW).
    pub low: u8,
    /// SCL high half-period (t_HIGH).
    pub high: u8,
    /// Repeated START setup time (t_SU;STA).
    pub su_sta: u8,
    /// STOP condition setup time (t_SU;STO).
    pub su_sto: u8,
    /// Bus-free time between STOP and the next START (t_BUF).
    pub buf: u8,
    /// Post-STOP quiet time (t_SU;STO + t_BUF).
    pub stop_hold: u8,
}

impl Timings {
    /// Derives the timing table for `mode` from the CPU clock.
    pub const fn new(mode: Mode, cpu: HertzU32) -> Self {
        // figures in tenths of µs, per the I²C specification
        match mode {
            Mode::Standard => Timings {
                hd_sta: loop3_count(40, cpu),
                low: loop3_count(47, cpu),
                high: loop3_count(40, cpu),
                su_sta: loop3_count(47, cpu),
                su_sto: loop3_count(40, cpu),
                buf: loop3_count(47, cpu),
                stop_hold: loop3_count(40 + 47, cpu),
            },
            Mode::Fast => Timings {
                hd_sta: loop3_count(6, cpu),
                low: loop3_count(13, cpu),
                high: loop3_count(6, cpu),
                su_sta: loop3_count(6, cpu),
                su_sto: loop3_count(6, cpu),
                buf: loop3_count(13, cpu),
                stop_hold: loop3_count(6 + 13, cpu),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU_16MHZ: HertzU32 = HertzU32::from_raw(16_000_000);
    const CPU_8MHZ: HertzU32 = HertzU32::from_raw(8_000_000);

    #[test]
    fn loop_counts_round_up() {
        // 4.7 µs at 16 MHz is 75.2 cycles, 25.07 iterations
        assert_eq!(loop3_count(47, CPU_16MHZ), 26);
        // 4.0 µs at 16 MHz is 64 cycles, exactly 21.33 iterations
        assert_eq!(loop3_count(40, CPU_16MHZ), 22);
        // sub-iteration delays are rounded to a single iteration
        assert_eq!(loop3_count(1, HertzU32::from_raw(1_000_000)), 1);
    }

    #[test]
    fn stop_hold_matches_datasheet_sums() {
        let standard = Timings::new(Mode::Standard, CPU_16MHZ);
        // 8.7 µs at 16 MHz: 139.2 cycles, 46.4 iterations
        assert_eq!(standard.stop_hold, 47);

        let fast = Timings::new(Mode::Fast, CPU_16MHZ);
        // 1.9 µs at 16 MHz: 30.4 cycles, 10.1 iterations
        assert_eq!(fast.stop_hold, 11);
    }

    #[test]
    fn bitrate_from_cpu_clock() {
        assert_eq!(twi_bitrate(Mode::Standard, CPU_16MHZ), Some(72));
        assert_eq!(twi_bitrate(Mode::Fast, CPU_16MHZ), Some(12));
        assert_eq!(twi_bitrate(Mode::Standard, CPU_8MHZ), Some(32));
        // 1 MHz cannot reach 400 kHz SCL
        assert_eq!(twi_bitrate(Mode::Fast, HertzU32::from_raw(1_000_000)), None);
    }

    #[test]
    fn host_loop_is_a_noop() {
        loop3(0);
        loop3(255);
    }
}
