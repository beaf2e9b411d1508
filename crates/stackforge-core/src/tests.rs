use std::cmp::Ordering;

use crate::{compare, resolve_latest, Version};

#[test]
fn release_outranks_its_own_prerelease() {
    assert_eq!(
        compare("1.0.0", "1.0.0-beta").expect("must compare"),
        Ordering::Greater
    );
    assert_eq!(
        compare("1.0.0-beta", "1.0.0").expect("must compare"),
        Ordering::Less
    );
}

#[test]
fn core_components_compare_numerically() {
    assert_eq!(
        compare("1.2.0", "1.10.0").expect("must compare"),
        Ordering::Less
    );
    assert_eq!(
        compare("2.0.0", "1.99.99").expect("must compare"),
        Ordering::Greater
    );
}

#[test]
fn compare_is_reflexive() {
    for raw in ["0.0.0", "1.2.3", "v4.5.6-rc.1", "10.0.0-beta.8"] {
        assert_eq!(compare(raw, raw).expect("must compare"), Ordering::Equal);
    }
}

#[test]
fn leading_v_and_missing_components_are_normalized() {
    assert_eq!(compare("v1.2", "1.2.0").expect("must compare"), Ordering::Equal);
    assert_eq!(compare("1", "v1.0.0").expect("must compare"), Ordering::Equal);
    assert_eq!(
        Version::parse("v3").expect("must parse").to_string(),
        "3.0.0"
    );
}

#[test]
fn prerelease_tags_compare_lexically() {
    assert_eq!(
        compare("1.0.0-alpha", "1.0.0-beta").expect("must compare"),
        Ordering::Less
    );
    // lexical, so beta.10 sorts below beta.9
    assert_eq!(
        compare("1.0.0-beta.10", "1.0.0-beta.9").expect("must compare"),
        Ordering::Less
    );
}

#[test]
fn first_unequal_component_decides() {
    assert_eq!(
        compare("1.3.0-alpha", "1.2.9").expect("must compare"),
        Ordering::Greater
    );
}

#[test]
fn compare_is_antisymmetric_and_transitive() {
    let samples = [
        "0.9.0",
        "1.0.0-alpha",
        "1.0.0-beta",
        "1.0.0-beta.8",
        "1.0.0",
        "1.0.1",
        "1.2.0",
        "1.10.0",
        "v2.0.0-rc.1",
    ];

    for a in samples {
        for b in samples {
            let ab = compare(a, b).expect("must compare");
            let ba = compare(b, a).expect("must compare");
            assert_eq!(ab, ba.reverse(), "antisymmetry failed for {a} / {b}");

            for c in samples {
                let bc = compare(b, c).expect("must compare");
                if ab != Ordering::Greater && bc != Ordering::Greater {
                    assert_ne!(
                        compare(a, c).expect("must compare"),
                        Ordering::Greater,
                        "transitivity failed for {a} <= {b} <= {c}"
                    );
                }
            }
        }
    }
}

#[test]
fn malformed_versions_are_errors() {
    for raw in [
        "", "v", "latest", "1.x.0", "1..0", "1.2.3.4", "-1.0.0", "1.0.0-", "1.0.0+build",
        "1.0.0-be ta",
    ] {
        let err = Version::parse(raw).expect_err("must reject malformed version");
        assert_eq!(err.input, raw);
    }

    let err = compare("1.0.0", "not-a-version").expect_err("must propagate malformed side");
    assert_eq!(err.input, "not-a-version");
}

#[test]
fn display_round_trips_prerelease() {
    let version = Version::parse("v1.4.2-beta.8").expect("must parse");
    assert_eq!(version.to_string(), "1.4.2-beta.8");
    assert_eq!(version.prerelease(), Some("beta.8"));
    assert!(version.is_prerelease());
    assert_eq!((version.major(), version.minor(), version.patch()), (1, 4, 2));
}

#[test]
fn resolve_latest_selects_maximum() {
    let latest = resolve_latest(["1.0.0", "1.2.0", "1.1.0"]).expect("must resolve");
    assert_eq!(latest.to_string(), "1.2.0");
}

#[test]
fn resolve_latest_may_return_prerelease_when_no_stable_exists() {
    let latest =
        resolve_latest(["v0.9.0-beta.1", "v0.9.0-beta.2", "v0.8.0-beta.7"]).expect("must resolve");
    assert_eq!(latest.to_string(), "0.9.0-beta.2");

    let latest = resolve_latest(["v1.0.0-rc.1", "v1.0.0"]).expect("must resolve");
    assert_eq!(latest.to_string(), "1.0.0");
}

#[test]
fn resolve_latest_skips_malformed_tags_and_fails_closed() {
    let latest = resolve_latest(["nightly", "1.1.0", "garbage-tag"]).expect("must resolve");
    assert_eq!(latest, Version::new(1, 1, 0));

    assert!(resolve_latest(["nightly", "", "main"]).is_none());
    assert!(resolve_latest(Vec::<String>::new()).is_none());
}
