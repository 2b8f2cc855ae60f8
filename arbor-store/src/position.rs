//! Fractional positions for ordering list children.
//!
//! A position is a string compared byte by byte. Generated positions use the
//! printable ASCII range `' '..='~'` as base-95 digits, so between two
//! distinct positions there is almost always room for another one and
//! inserting never renumbers existing siblings.
//!
//! Generated positions never end with the lowest digit (`' '`), which keeps
//! room below every generated position as well. Client-supplied bounds may
//! hold any character; squeezed against such a bound the allocator falls
//! back to a control character, and only `hi == lo + "\0"` leaves no room.

/// Lowest digit character.
const MIN_CHAR: u8 = b' ';
/// Highest digit character.
const MAX_CHAR: u8 = b'~';

/// A position with no neighbours.
pub fn first() -> String {
    between_opt(None, None)
}

/// A position strictly after `lo`, and strictly before `hi` when given.
pub fn between(lo: &str, hi: Option<&str>) -> String {
    between_opt(Some(lo), hi)
}

/// A position strictly before `hi`.
pub fn before(hi: &str) -> String {
    between_opt(None, Some(hi))
}

/// A position strictly between two optional bounds.
///
/// A missing `lo` means "before everything", a missing `hi` means "after
/// everything". Bounds in the wrong order, or with nothing between them,
/// are treated as if `hi` were absent.
pub fn between_opt(lo: Option<&str>, hi: Option<&str>) -> String {
    if let Some(found) = try_between(lo, hi) {
        return found;
    }
    log::debug!("no position between {lo:?} and {hi:?}, ignoring upper bound");
    match try_between(lo, None) {
        Some(found) => found,
        None => format!("{}O", lo.unwrap_or_default()),
    }
}

/// A position `p` with `lo < p < hi`, or `None` when no string fits.
pub fn try_between(lo: Option<&str>, hi: Option<&str>) -> Option<String> {
    let lo = lo.unwrap_or_default().as_bytes();
    let hi = hi.map(str::as_bytes);
    if hi.is_some_and(|hi| hi <= lo) {
        return None;
    }
    String::from_utf8(midpoint(lo, hi)?)
        .ok()
        .filter(|found| found.as_bytes() > lo && hi.map_or(true, |hi| found.as_bytes() < hi))
}

/// Bytes strictly between `lo` and `hi` (`hi = None` is +infinity).
///
/// Expects `lo < hi`. The output only copies whole characters of `lo` and
/// `hi`, so it is valid UTF-8 whenever both inputs are.
fn midpoint(lo: &[u8], hi: Option<&[u8]>) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(lo.len() + 1);
    // Whether `out` still equals the prefix of each bound.
    let mut tied_lo = true;
    let mut tied_hi = hi.is_some();
    // Proper prefix of `hi` already known to fit.
    let mut fallback = None;
    let mut i = 0;

    loop {
        let below = if tied_lo { lo.get(i).copied() } else { None };
        let above = match hi {
            Some(hi) if tied_hi => hi.get(i).copied(),
            _ => None,
        };

        let lowest = below.map_or(MIN_CHAR as u16, |b| (b as u16 + 1).max(MIN_CHAR as u16));
        let highest = above.map_or(MAX_CHAR as u16, |a| {
            (a as u16).saturating_sub(1).min(MAX_CHAR as u16)
        });

        if lowest <= highest {
            let digit = ((lowest + highest + 1) / 2) as u8;
            out.push(digit);
            if digit > MIN_CHAR {
                return Some(out);
            }
            // Ending on the lowest digit leaves no room below the result.
            tied_lo = false;
            tied_hi = false;
        } else if let Some(b) = below {
            out.push(b);
            tied_hi = tied_hi && above == Some(b);
        } else {
            // `lo` is behind us and `hi` sits at or below the lowest digit.
            let a = above?;
            let hi_len = hi.map_or(0, <[u8]>::len);
            tied_lo = false;
            if i + 1 < hi_len {
                out.push(a);
                fallback = Some(out.clone());
            } else if a > 0 {
                out.push(a - 1);
                return Some(out);
            } else {
                return fallback;
            }
        }
        i += 1;
    }
}
