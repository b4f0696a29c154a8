mod common;

use std::sync::Arc;

use curp::{
    client, replica, Ack, Client, Command, CommandId, Config, Path, RecordAck, Reply, Value,
    Variant, WeakReply,
};

use common::Recorder;

fn reply(cmd_id: CommandId, value: &str, ok: Ack) -> client::In {
    client::In::Reply(Reply { replica: 0, cmd_id, value: Value::from(value), ok })
}

fn sync_reply(cmd_id: CommandId, value: &str) -> client::In {
    client::In::SyncReply(Reply { replica: 0, cmd_id, value: Value::from(value), ok: Ack::True })
}

fn record(replica: usize, cmd_id: CommandId, ok: Ack, weak_dep: Option<CommandId>) -> client::In {
    client::In::RecordAck(RecordAck { replica, ballot: 0, cmd_id, ok, weak_dep })
}

fn syncs(recorder: &Recorder) -> usize {
    recorder.to_replicas()
        .into_iter()
        .filter(|(to, message)| *to == Some(0) && matches!(message, replica::In::Sync(_)))
        .count()
}

fn client(config: Config, bound: usize) -> (Client<Arc<Recorder>>, Arc<Recorder>) {
    let recorder = Recorder::new();
    (Client::new(7, bound, config, recorder.clone()).unwrap(), recorder)
}

#[test]
fn consistent_acks_complete_on_the_fast_path() {
    let (client, recorder) = client(Config::new(3, 0), 0);
    let (cmd_id, mut done) = client.propose(Command::get(1));
    assert!(matches!(&recorder.to_replicas()[0], (None, replica::In::Propose(_))));

    client.handle(record(1, cmd_id, Ack::True, None));
    client.handle(record(2, cmd_id, Ack::Ordered, None));
    assert_eq!(done.try_recv(), Ok(None));

    client.handle(reply(cmd_id, "v", Ack::True));
    let completion = done.try_recv().unwrap().unwrap();
    assert_eq!(completion.path, Path::Fast);
    assert_eq!(completion.value, Value::from("v"));
    assert_eq!(client.stats().fast, 1);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(syncs(&recorder), 0);
}

#[test]
fn mismatched_weak_dependencies_escalate_once() {
    let (client, recorder) = client(Config::new(5, 0), 0);
    let (cmd_id, mut done) = client.propose(Command::get(1));
    let weak = CommandId { client_id: 3, seq_num: 9 };

    client.handle(reply(cmd_id, "v", Ack::True));
    client.handle(record(1, cmd_id, Ack::True, Some(weak)));
    client.handle(record(2, cmd_id, Ack::True, None));
    client.handle(record(3, cmd_id, Ack::True, Some(weak)));
    assert_eq!(client.stats().escalated, 1);
    assert_eq!(syncs(&recorder), 1);

    // More acks and replays do not escalate again
    client.handle(record(4, cmd_id, Ack::True, None));
    client.handle(reply(cmd_id, "v", Ack::True));
    assert_eq!(client.stats().escalated, 1);
    assert_eq!(syncs(&recorder), 1);
    assert_eq!(done.try_recv(), Ok(None));

    client.handle(sync_reply(cmd_id, "committed"));
    let completion = done.try_recv().unwrap().unwrap();
    assert_eq!(completion.path, Path::Slow);
    assert_eq!(completion.value, Value::from("committed"));
    let stats = client.stats();
    assert_eq!((stats.fast, stats.slow, stats.escalated), (0, 1, 1));
}

#[test]
fn refused_leader_reply_escalates_immediately() {
    let (client, recorder) = client(Config::new(3, 0), 0);
    let (cmd_id, mut done) = client.propose(Command::put(1, "x"));
    client.handle(reply(cmd_id, "", Ack::False));
    assert_eq!(syncs(&recorder), 1);

    // The slow certificate still needs a witness besides the leader
    client.handle(sync_reply(cmd_id, "x"));
    assert_eq!(done.try_recv(), Ok(None));
    client.handle(record(2, cmd_id, Ack::False, None));
    assert_eq!(done.try_recv().unwrap().map(|completion| completion.path), Some(Path::Slow));

    // Stragglers for a completed command are dropped
    client.handle(record(1, cmd_id, Ack::True, None));
    assert_eq!(client.stats().slow, 1);
}

#[test]
fn refusing_witness_blocks_the_fast_path() {
    let (client, recorder) = client(Config::new(3, 0), 0);
    let (cmd_id, mut done) = client.propose(Command::put(1, "x"));
    client.handle(reply(cmd_id, "", Ack::True));
    client.handle(record(1, cmd_id, Ack::True, None));
    client.handle(record(2, cmd_id, Ack::False, None));
    assert_eq!(done.try_recv(), Ok(None));
    assert_eq!(syncs(&recorder), 1);
}

#[test]
fn stale_ballot_acks_are_ignored() {
    let (client, _) = client(Config::new(3, 0).with_ballot(2), 0);
    let (cmd_id, mut done) = client.propose(Command::get(1));
    client.handle(reply(cmd_id, "v", Ack::True));
    client.handle(record(1, cmd_id, Ack::True, None));
    client.handle(record(2, cmd_id, Ack::True, None));
    assert_eq!(done.try_recv(), Ok(None));
}

#[test]
fn causal_replies_only_count_from_the_bound_replica() {
    let (client, recorder) = client(Config::new(3, 0).with_variant(Variant::Ho), 2);
    let (first, _) = client.propose_weak(Command::put(4, "a"));
    let (_, _) = client.propose(Command::get(4));
    let (second, mut done) = client.propose_weak(Command::get(4));

    let weak = recorder.to_replicas()
        .into_iter()
        .filter_map(|(to, message)| match message {
        | replica::In::CausalPropose(weak) => Some((to, weak)),
        | _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(weak.len(), 2);
    assert!(weak.iter().all(|(to, weak)| to.is_none() && weak.bound_replica == Some(2)));
    assert_eq!(weak[0].1.causal_dep, None);
    assert_eq!(weak[1].1.causal_dep, Some(first.seq_num));

    let answer = |replica| client::In::CausalReply(WeakReply { replica, cmd_id: second, value: Value::from("a") });
    client.handle(answer(0));
    client.handle(answer(1));
    assert_eq!(done.try_recv(), Ok(None));
    client.handle(answer(2));
    assert_eq!(done.try_recv().unwrap().map(|completion| completion.path), Some(Path::Weak));
    assert_eq!(client.stats().weak, 1);
}

#[test]
fn leader_only_weak_commands_go_to_the_leader() {
    let (client, recorder) = client(Config::new(3, 1).with_variant(Variant::Ht), 0);
    let (cmd_id, mut done) = client.propose_weak(Command::put(4, "a"));
    assert!(matches!(
        &recorder.to_replicas()[0],
        (Some(1), replica::In::WeakPropose(weak)) if weak.bound_replica.is_none()
    ));
    client.handle(client::In::WeakReply(WeakReply { replica: 1, cmd_id, value: Value::from("a") }));
    assert_eq!(done.try_recv().unwrap().map(|completion| completion.value), Some(Value::from("a")));
}
