// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output handling order.

use std::collections::{HashMap, HashSet};

use crate::job::OutputSpec;

/// Order outputs so that every output comes after the one it depends on.
///
/// Declaration order is kept where dependencies allow. A dependency on an
/// undeclared output is ignored; a cycle is broken at the first output seen
/// twice, so every output appears exactly once.
pub fn order_outputs(outputs: &[OutputSpec]) -> Vec<&OutputSpec> {
    let by_name: HashMap<&str, &OutputSpec> =
        outputs.iter().map(|o| (o.name.as_str(), o)).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(outputs.len());

    for output in outputs {
        // walk up the dependency chain, then emit top-down
        let mut chain = Vec::new();
        let mut current = Some(output);
        while let Some(spec) = current {
            if !visited.insert(spec.name.as_str()) {
                break;
            }
            chain.push(spec);
            current = spec
                .depends_on
                .as_deref()
                .and_then(|dep| by_name.get(dep).copied());
        }
        ordered.extend(chain.into_iter().rev());
    }
    ordered
}
