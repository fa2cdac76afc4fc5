use std::cmp::Ordering;

use crate::model::{DeviceId, FileRecord};

/// Order two candidate records advertised for the same path.
/// `Ordering::Greater` means `(a, a_device)` wins over `(b, b_device)`.
///
/// A record carrying the Invalid flag can only win against another Invalid
/// record, whatever the versions: a device that cannot serve the content
/// must not become the reference copy while a servable one exists. Among
/// records of equal validity the higher version wins, and remaining ties
/// break on the lowest device id.
pub fn cmp_candidates(
    a: &FileRecord,
    a_device: &DeviceId,
    b: &FileRecord,
    b_device: &DeviceId,
) -> Ordering {
    b.is_invalid()
        .cmp(&a.is_invalid())
        .then_with(|| a.version.cmp(&b.version))
        .then_with(|| b_device.cmp(a_device))
}

/// Index of the winning candidate, or `None` for an empty slate.
pub fn select_winner(candidates: &[(DeviceId, FileRecord)]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, (device, record)) in candidates.iter().enumerate() {
        best = match best {
            None => Some(i),
            Some(j) => {
                let (best_device, best_record) = &candidates[j];
                if cmp_candidates(record, device, best_record, best_device) == Ordering::Greater {
                    Some(i)
                } else {
                    Some(j)
                }
            }
        };
    }
    best
}

/// Whether a device holding `have` (its own copy, if any) is out of date
/// with respect to `global`, the winning record for the same path.
///
/// A winner that is itself Invalid has no servable source anywhere, so
/// nothing is needed. A missing copy is needed unless the winner is a
/// tombstone. An Invalid copy always needs the servable winner, even at an
/// equal or higher version.
pub fn needs(global: &FileRecord, have: Option<&FileRecord>) -> bool {
    if global.is_invalid() {
        return false;
    }
    match have {
        None => !global.is_deleted(),
        Some(have) => have.is_invalid() || global.version > have.version,
    }
}
