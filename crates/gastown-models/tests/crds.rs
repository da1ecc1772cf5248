/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_models::{BeadStore, Convoy, Polecat, Refinery, Rig, Witness};
use kube::CustomResourceExt;

#[test]
fn test_all_crds_render_to_yaml() {
    let crds = vec![
        Rig::crd(),
        Polecat::crd(),
        Convoy::crd(),
        Witness::crd(),
        Refinery::crd(),
        BeadStore::crd(),
    ];

    for crd in &crds {
        let yaml = serde_yaml::to_string(crd).expect("CRD should serialize");
        assert!(yaml.contains("gastown.gastown.io"));
        assert!(yaml.contains("v1alpha1"));
    }

    let names: Vec<String> = crds.iter().map(|c| c.spec.names.kind.clone()).collect();
    assert_eq!(
        names,
        vec!["Rig", "Polecat", "Convoy", "Witness", "Refinery", "BeadStore"]
    );
}

#[test]
fn test_only_rig_is_cluster_scoped() {
    assert_eq!(Rig::crd().spec.scope, "Cluster");
    for scope in [
        Polecat::crd().spec.scope,
        Convoy::crd().spec.scope,
        Witness::crd().spec.scope,
        Refinery::crd().spec.scope,
        BeadStore::crd().spec.scope,
    ] {
        assert_eq!(scope, "Namespaced");
    }
}

#[test]
fn test_polecat_schema_exposes_normative_field_names() {
    let yaml = serde_yaml::to_string(&Polecat::crd()).unwrap();
    for field in ["desiredState", "beadID", "gitSecretRef", "activeDeadlineSeconds", "cleanupStatus"] {
        assert!(yaml.contains(field), "missing field {}", field);
    }
}
