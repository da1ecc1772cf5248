/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_operator::cli::commands::crd_manifests;

#[test]
fn test_crd_manifests_cover_every_kind() {
    let yaml = crd_manifests().unwrap();
    let docs: Vec<&str> = yaml.split("---\n").collect();
    assert_eq!(docs.len(), 6);
    for kind in ["Rig", "Polecat", "Convoy", "Witness", "Refinery", "BeadStore"] {
        assert!(
            yaml.contains(&format!("kind: {}", kind)),
            "missing {}",
            kind
        );
    }
}
