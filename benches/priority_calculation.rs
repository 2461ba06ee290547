use chrono::{Duration, Utc};
use cognis_runtime::config::PriorityWeights;
use cognis_runtime::goals::{Goal, GoalType};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

fn make_goal() -> Goal {
    let mut goal = Goal::new(
        GoalType::Strategic,
        "code_optimization",
        "Improve cache hit ratio across the indexer",
        "Reduce redundant fingerprint reads on warm rescans",
    );
    goal.due_date = Some(Utc::now() + Duration::days(2));
    goal.dependencies = vec![Uuid::new_v4(), Uuid::new_v4()];
    goal.prerequisites = vec!["schema-review".to_string()];
    goal.assigned_to = vec!["arbiter-a".to_string(), "arbiter-b".to_string()];
    goal
}

fn bench_compute_priority(c: &mut Criterion) {
    let goal = make_goal();
    let weights = PriorityWeights::default();
    c.bench_function("goal_compute_priority", |b| {
        b.iter(|| black_box(goal.compute_priority(black_box(&weights))));
    });
}

criterion_group!(benches, bench_compute_priority);
criterion_main!(benches);
