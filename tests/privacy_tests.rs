use chrono::{TimeZone, Timelike, Utc};
use cohort_engine::privacy::{bucket_timestamp, laplace_noise, noise_scale, LaplaceMechanism, Pseudonymizer};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_hash_is_deterministic_and_opaque() {
    let p = Pseudonymizer::new("pepper");
    let a = p.hash_identifier("alice@example.com");
    let b = p.hash_identifier("alice@example.com");
    let c = p.hash_identifier("bob@example.com");

    assert_eq!(a, b, "Same input must give the same digest");
    assert_ne!(a, c);
    assert_eq!(a.as_str().len(), 32);
    assert!(!a.as_str().contains("alice"));
    assert!(a.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    // Debug output must not leak the digest either.
    assert!(!format!("{:?}", a).contains(a.as_str()));
}

#[test]
fn test_salt_separates_deployments() {
    let a = Pseudonymizer::new("one").hash_identifier("user-1");
    let b = Pseudonymizer::new("two").hash_identifier("user-1");
    assert_ne!(a, b);
}

#[test]
fn test_cluster_id_ignores_channel_order_and_user_domain() {
    let p = Pseudonymizer::new("pepper");
    let x = p.cluster_id(&["memory", "affect"]);
    let y = p.cluster_id(&["affect", "memory", "affect"]);
    assert_eq!(x, y);
    // A user literally named like a channel signature must not collide with a cluster.
    let user = p.hash_identifier("affect\u{1f}memory");
    assert_ne!(x.as_str(), user.as_str());
}

#[test]
fn test_bucket_timestamp_rounds_down_to_hour() {
    let t = Utc.with_ymd_and_hms(2024, 3, 9, 14, 59, 59).unwrap();
    let b = bucket_timestamp(t);
    assert_eq!(b, Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap());
    assert_eq!(b.minute(), 0);
    assert_eq!(bucket_timestamp(b), b, "Bucketing is idempotent");

    let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
    assert_eq!(bucket_timestamp(before_epoch), Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap());
}

#[test]
fn test_noise_magnitude_shrinks_as_epsilon_grows() {
    let mut rng = StdRng::seed_from_u64(7);
    let samples = 20_000;
    let mut previous = f64::INFINITY;

    for epsilon in [0.5, 5.0, 50.0] {
        let scale = noise_scale(1.0, epsilon);
        let mean_abs: f64 = (0..samples).map(|_| laplace_noise(&mut rng, scale).abs()).sum::<f64>() / samples as f64;
        // E|Laplace(0, b)| = b
        assert!((mean_abs - scale).abs() < scale * 0.1, "epsilon {}: mean |noise| {} vs scale {}", epsilon, mean_abs, scale);
        assert!(mean_abs < previous, "Noise must shrink as epsilon grows");
        previous = mean_abs;
    }
}

#[test]
fn test_noise_is_centered() {
    let mut rng = StdRng::seed_from_u64(11);
    let n = 50_000;
    let mean: f64 = (0..n).map(|_| laplace_noise(&mut rng, 1.0)).sum::<f64>() / n as f64;
    assert!(mean.abs() < 0.05, "Laplace noise should be zero-mean, got {}", mean);
}

#[test]
fn test_mechanism_converges_at_huge_epsilon() {
    let mut rng = StdRng::seed_from_u64(3);
    let mechanism = LaplaceMechanism::new(1e12);
    let (noisy, scale) = mechanism.perturb(&mut rng, 0.42, 0.1);
    assert!(scale > 0.0);
    assert!((noisy - 0.42).abs() < 1e-6);
}

#[test]
fn test_non_positive_scale_adds_nothing() {
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(laplace_noise(&mut rng, 0.0), 0.0);
    assert_eq!(laplace_noise(&mut rng, -1.0), 0.0);
}
