//! Binary channel mask primitives
//!
//! A mask holds one boolean per channel: `true` keeps the channel,
//! `false` winnows it. A running winnowed mask accumulates pruning
//! decisions across multiple rounds.

/// One boolean per channel; `true` = keep, `false` = winnow.
pub type Mask = Vec<bool>;

/// Indices of the kept (one) positions in a mask.
pub fn one_positions(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .map(|(idx, _)| idx)
        .collect()
}

/// Indices of the winnowed (zero) positions in a mask.
pub fn zero_positions(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|(_, keep)| !**keep)
        .map(|(idx, _)| idx)
        .collect()
}

/// Indices at which both masks have a one, counted only among the ones
/// of `more_ones_mask`.
///
/// Example: with `more_ones_mask = 1,0,0,1,1,0,1,0,1,1` and
/// `less_ones_mask = 1,0,0,0,1,0,0,0,1,0`, the overlapping ones sit at
/// absolute positions 0, 4 and 8 — the 0th, 2nd and 4th ones of
/// `more_ones_mask` — so the result is `[0, 2, 4]`.
///
/// Precondition (validated in debug builds only): wherever
/// `less_ones_mask` has a one, `more_ones_mask` has a one at the same
/// position. Release builds leave the precondition unchecked.
pub fn overlap_indices(more_ones_mask: &[bool], less_ones_mask: &[bool]) -> Vec<usize> {
    debug_assert_eq!(more_ones_mask.len(), less_ones_mask.len());
    debug_assert!(
        more_ones_mask
            .iter()
            .zip(less_ones_mask)
            .all(|(big, small)| *big || !*small),
        "less_ones_mask must be a positional subset of more_ones_mask"
    );

    let mut indices = Vec::new();
    let mut ones_seen = 0;
    for (big, small) in more_ones_mask.iter().zip(less_ones_mask) {
        if *big && *small {
            indices.push(ones_seen);
        }
        if *big {
            ones_seen += 1;
        }
    }
    indices
}

/// Fold a new round of winnowing into a running mask, in place.
///
/// `new_mask` has one entry per surviving (one) position of
/// `original_mask`; each zero in `new_mask` zeroes the corresponding
/// one of `original_mask`, ranked among the ones only.
///
/// Example: original `1,1,0,1,0,0,1,1,1,0,0,1` with new `1,1,0,0,1,0,1`
/// zeroes the 2nd, 3rd and 5th ones, giving
/// `1,1,0,0,0,0,0,1,0,0,0,1`.
///
/// Panics if `new_mask`'s length differs from the number of ones in
/// `original_mask`; that indicates a logic bug in the caller, not bad
/// input data.
pub fn update_winnowed_mask(original_mask: &mut [bool], new_mask: &[bool]) {
    let ones = one_positions(original_mask);
    assert_eq!(
        new_mask.len(),
        ones.len(),
        "new mask length must equal the number of ones in the original mask"
    );
    for idx in zero_positions(new_mask) {
        original_mask[ones[idx]] = false;
    }
}
