mod common;

use std::sync::Arc;

use common::sample_context;
use danci_decision::{
    Action, BanditContext, ColdStartClassifier, ColdStartFeedback, ColdStartPhase,
    ContextualBanditModel, ExecutionRouter, SelectionSource, TypeDistribution, UserType,
};

fn bandit() -> ContextualBanditModel {
    ContextualBanditModel::with_seed(5, Arc::new(ExecutionRouter::default()))
}

/// 按阶段跑完整一轮：选择 → 反馈
fn drive(
    classifier: &mut ColdStartClassifier,
    bandit: &mut ContextualBanditModel,
    feedback: &[ColdStartFeedback],
) -> Vec<ColdStartPhase> {
    let ctx = sample_context();
    let candidates = vec![
        Action::for_user_type(UserType::Fast),
        Action::for_user_type(UserType::Stable),
        Action::for_user_type(UserType::Cautious),
    ];
    let mut phases = vec![classifier.phase()];
    for fb in feedback {
        let sel = classifier
            .select_action(&candidates, &ctx, bandit, &Action::default())
            .unwrap();
        bandit.update(&sel.action, &ctx, fb.reward);
        phases.push(classifier.update(&sel.action, fb));
    }
    phases
}

fn repeat(feedback: ColdStartFeedback, n: usize) -> Vec<ColdStartFeedback> {
    vec![feedback; n]
}

#[test]
fn high_reward_quick_answers_classify_as_fast() {
    let mut c = ColdStartClassifier::default();
    drive(&mut c, &mut bandit(), &repeat(ColdStartFeedback::new(1.0, true, 1_000.0, 0.05).at(1), 3));
    assert_eq!(c.phase(), ColdStartPhase::Explore);
    assert_eq!(c.user_type(), Some(UserType::Fast));
    assert_eq!(c.get_progress(), 0.5);
}

#[test]
fn low_reward_slow_answers_classify_as_cautious() {
    let mut c = ColdStartClassifier::default();
    drive(&mut c, &mut bandit(), &repeat(ColdStartFeedback::new(0.0, false, 5_000.0, 0.8).at(1), 3));
    assert_eq!(c.user_type(), Some(UserType::Cautious));
    assert_eq!(
        c.settled_strategy(),
        Some(&Action::for_user_type(UserType::Cautious))
    );
}

#[test]
fn middling_answers_use_all_probes_then_classify_as_stable() {
    let mut c = ColdStartClassifier::default();
    // 接近 stable 但不足以提前结束
    let fb = ColdStartFeedback::new(0.7, true, 2_500.0, 0.25).at(1);
    let phases = drive(&mut c, &mut bandit(), &repeat(fb, 3));
    assert_eq!(
        phases,
        vec![
            ColdStartPhase::Classify,
            ColdStartPhase::Classify,
            ColdStartPhase::Classify,
            ColdStartPhase::Explore,
        ]
    );
    assert_eq!(c.user_type(), Some(UserType::Stable));
}

#[test]
fn identical_inputs_give_identical_classifiers() {
    let feedback: Vec<ColdStartFeedback> = (0..10)
        .map(|i| {
            ColdStartFeedback::new(
                0.1 * i as f64,
                i % 2 == 0,
                800.0 + 400.0 * i as f64,
                0.05 * i as f64,
            )
            .at(1_000 + i)
        })
        .collect();

    let mut a = ColdStartClassifier::default();
    let mut b = ColdStartClassifier::default();
    let pa = drive(&mut a, &mut bandit(), &feedback);
    let pb = drive(&mut b, &mut bandit(), &feedback);

    assert_eq!(pa, pb);
    assert_eq!(a.posterior(), b.posterior());
    assert_eq!(a.user_type(), b.user_type());
    assert_eq!(a.settled_strategy(), b.settled_strategy());
    assert_eq!(a.get_state(), b.get_state());
}

#[test]
fn phases_only_move_forward() {
    let rank = |p: ColdStartPhase| match p {
        ColdStartPhase::Classify => 0,
        ColdStartPhase::Explore => 1,
        ColdStartPhase::Normal => 2,
    };
    let inputs = [
        ColdStartFeedback::new(1.0, true, 900.0, 0.0),
        ColdStartFeedback::new(-1.0, false, 9_000.0, 1.0),
        ColdStartFeedback::new(0.3, true, 2_500.0, 0.4),
    ];
    let feedback: Vec<ColdStartFeedback> = (0..15).map(|i| inputs[i % 3].at(i as i64)).collect();

    let mut c = ColdStartClassifier::default();
    let phases = drive(&mut c, &mut bandit(), &feedback);
    assert!(phases.windows(2).all(|w| rank(w[0]) <= rank(w[1])));
    assert_eq!(phases.last(), Some(&ColdStartPhase::Normal));

    c.reset();
    assert_eq!(c.phase(), ColdStartPhase::Classify);
    assert_eq!(c.probe_index(), 0);
    assert_eq!(c.results().len(), 0);
    assert!(c.user_type().is_none());
    assert!(c.settled_strategy().is_none());
}

#[test]
fn explore_phase_delegates_to_the_bandit() {
    let mut c = ColdStartClassifier::default();
    let mut b = bandit();
    drive(&mut c, &mut b, &repeat(ColdStartFeedback::new(1.0, true, 1_000.0, 0.05).at(1), 2));
    assert_eq!(c.phase(), ColdStartPhase::Explore);

    let only = [Action::for_user_type(UserType::Stable)];
    let sel = c
        .select_action(&only, &BanditContext::default(), &mut b, &Action::default())
        .unwrap();
    assert_eq!(sel.source, SelectionSource::Explore);
    assert_eq!(sel.action, only[0]);

    // explore 阶段仍然要求非空候选集
    assert!(c
        .select_action(&[], &BanditContext::default(), &mut b, &Action::default())
        .is_err());
}

#[test]
fn population_priors_tilt_the_posterior() {
    let ambiguous = ColdStartFeedback::new(0.75, true, 2_250.0, 0.2).at(1);

    let mut uniform = ColdStartClassifier::default();
    uniform.update(&Action::default(), &ambiguous);

    let mut tilted = ColdStartClassifier::default();
    tilted.set_global_priors(TypeDistribution::from_array([0.05, 0.05, 0.9]));
    tilted.update(&Action::default(), &ambiguous);

    assert!(tilted.posterior().cautious > uniform.posterior().cautious);
    assert!((tilted.posterior().sum() - 1.0).abs() < 1e-5);

    tilted.set_global_priors(TypeDistribution::from_array([f64::NAN, -1.0, 0.0]));
    let kept = tilted.global_priors().unwrap();
    assert!((kept.cautious - 0.9).abs() < 1e-12);
}
