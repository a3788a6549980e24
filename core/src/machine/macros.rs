//! Small macros used by the CPU's instruction implementations.

/// Sets the zero/subtract/half-carry/carry flags in one line, accepting
/// `_` for "leave unchanged".
///
/// ```ignore
/// set_flags!(self.cpu, z = result == Byte::zero(), n = false, h = half_carry, c = carry);
/// ```
macro_rules! set_flags {
    ($cpu:expr, z = $z:expr, n = $n:expr, h = $h:expr, c = $c:expr) => {
        set_flags!(@one $cpu, z, $z);
        set_flags!(@one $cpu, n, $n);
        set_flags!(@one $cpu, h, $h);
        set_flags!(@one $cpu, c, $c);
    };
    (@one $cpu:expr, $flag:ident, _) => {};
    (@one $cpu:expr, z, $val:expr) => { $cpu.set_zero($val); };
    (@one $cpu:expr, n, $val:expr) => { $cpu.set_subtract($val); };
    (@one $cpu:expr, h, $val:expr) => { $cpu.set_half_carry($val); };
    (@one $cpu:expr, c, $val:expr) => { $cpu.set_carry($val); };
}

pub(crate) use set_flags;
