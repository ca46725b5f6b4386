use criterion::{Criterion, criterion_group, criterion_main};
use step_store::{
    InMemoryStepStore, MessageId, SagaId, SagaStepMetadata, SaveOptions, StepKey, StepStatus,
    StepStore,
};

fn make_step(saga_id: SagaId, index: usize, parent: Option<MessageId>) -> SagaStepMetadata {
    SagaStepMetadata::new(
        StepKey::new(
            saga_id,
            format!("Step{index}"),
            format!("Step{index}Handler"),
            MessageId::new(),
        ),
        parent,
        StepStatus::Started,
        br#"{"order_id":"00000000-0000-0000-0000-000000000001"}"#.to_vec(),
    )
}

fn bench_save_new_step(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("step_store/save_new_step", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStepStore::new();
                let step = make_step(SagaId::new(), 0, None);
                store.save(step, SaveOptions::expect_new()).await.unwrap();
            });
        });
    });
}

fn bench_start_and_complete(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("step_store/start_and_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStepStore::new();
                let step = make_step(SagaId::new(), 0, None);
                store
                    .save(step.clone(), SaveOptions::expect_new())
                    .await
                    .unwrap();
                store
                    .save(
                        step.transitioned(StepStatus::Completed, Vec::new()),
                        SaveOptions::expect_status(StepStatus::Started),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_query_saga_of_50_steps(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStepStore::new();
    let saga_id = SagaId::new();

    rt.block_on(async {
        let mut parent = None;
        for index in 0..50 {
            let step = make_step(saga_id, index, parent);
            parent = Some(step.message_id);
            store.save(step, SaveOptions::expect_new()).await.unwrap();
        }
        // Unrelated sagas the query has to filter out.
        for index in 0..500 {
            store
                .save(make_step(SagaId::new(), index, None), SaveOptions::new())
                .await
                .unwrap();
        }
    });

    c.bench_function("step_store/query_saga_of_50_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let history = store.query_by_saga(saga_id).await.unwrap();
                assert_eq!(history.len(), 50);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_save_new_step,
    bench_start_and_complete,
    bench_query_saga_of_50_steps
);
criterion_main!(benches);
