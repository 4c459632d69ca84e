/*
    TrackFlux
    https://github.com/dbalsom/trackflux

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/clock.rs

    Unit conversions between the high-resolution system tick clock, the
    slow-tick clock used for revolution accounting (sysclk/8), and real-time
    units. All timing state the engine keeps (ticks_per_cell, write_bc_ticks,
    stk_per_rev) is derived through these.
*/

/// System clock frequency in MHz. The slow-tick clock runs at sysclk/8.
pub const SYSCLK_MHZ: u32 = 72;

pub const fn sysclk_us(us: u32) -> u32 {
    us * SYSCLK_MHZ
}

pub const fn sysclk_ms(ms: u32) -> u32 {
    ms * 1000 * SYSCLK_MHZ
}

pub const fn sysclk_ns(ns: u32) -> u32 {
    (ns * SYSCLK_MHZ) / 1000
}

pub const fn stk_ms(ms: u32) -> u32 {
    sysclk_ms(ms) / 8
}

/// Slow ticks to system ticks.
pub const fn sysclk_stk(stk: u32) -> u32 {
    stk * 8
}

/// System ticks to slow ticks.
pub const fn stk_sysclk(sysclk: u32) -> u32 {
    sysclk / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revolution_accounting() {
        // One 300 RPM revolution is 200ms: 14.4M system ticks, 1.8M slow ticks.
        assert_eq!(sysclk_ms(200), 14_400_000);
        assert_eq!(stk_ms(200), 1_800_000);
        assert_eq!(sysclk_stk(stk_ms(200)), sysclk_ms(200));
    }

    #[test]
    fn test_write_cell_widths() {
        // DD bitcells are 4us wide when written at 250kbps.
        assert_eq!(sysclk_ms(1) / 250, sysclk_us(4));
        // HFE at a declared 250 kbit/s stores cells half that wide.
        assert_eq!(sysclk_us(500) / 250, sysclk_us(2));
    }
}
