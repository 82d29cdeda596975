//! Property tests of buffer ordering and pause accounting

use kafka_pull_source::consumer::{
    ClientCall, ConsumerSettings, MemoryBroker, MemoryClient, ShutdownHandle, SourceLogic,
    Subscription, TopicPartition,
};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Produce(usize),
    Timer,
    Pull,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..5).prop_map(Op::Produce),
        Just(Op::Timer),
        Just(Op::Pull),
    ]
}

fn run(capacity: usize, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let p0 = TopicPartition::new("events", 0);
        let broker: MemoryBroker<(), i64> = MemoryBroker::new();
        let settings = ConsumerSettings::builder()
            .buffer_size(capacity)
            .poll_timeout(Duration::from_millis(1))
            .build();
        let mut logic: SourceLogic<MemoryClient<(), i64>> = SourceLogic::new(
            settings,
            Subscription::assignment(vec![p0.clone()]),
            ShutdownHandle::new(),
        );
        logic.pre_start(&broker.factory()).unwrap();

        let mut produced = 0i64;
        let mut delivered = Vec::new();
        for op in ops {
            match op {
                Op::Produce(n) => {
                    for _ in 0..n {
                        broker.produce("events", 0, produced, (), produced);
                        produced += 1;
                    }
                }
                Op::Timer => logic.on_timer().await,
                Op::Pull => logic.on_pull().await,
            }
            if let Some(message) = logic.take_element() {
                delivered.push(message.record.value);
            }

            prop_assert_eq!(logic.is_paused(), broker.paused().contains(&p0));
            if logic.is_paused() {
                prop_assert!(logic.buffered() > 0);
            }
        }

        // delivered records are a prefix of the produced sequence
        let expected: Vec<i64> = (0..delivered.len() as i64).collect();
        prop_assert_eq!(delivered, expected);

        // pause and resume strictly alternate, starting with pause
        for (i, call) in broker.flow_calls().iter().enumerate() {
            let is_pause = matches!(call, ClientCall::Pause(_));
            prop_assert_eq!(is_pause, i % 2 == 0);
        }
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn buffer_keeps_order_and_pause_alternates(
        capacity in 1usize..6,
        ops in proptest::collection::vec(op(), 1..40),
    ) {
        run(capacity, ops)?;
    }
}
