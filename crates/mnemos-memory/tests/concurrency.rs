//! Concurrent access to one engine instance from many threads.

use std::sync::Barrier;
use std::thread;

use mnemos_memory::store::RecordStore;
use mnemos_memory::{AgentMemory, DocumentMemory, IndexParams, MemoryError, StorageLocation};
use mnemos_types::{AgentMemoryRecord, DocumentQuery, EmbeddingRecord, MemoryQuery};

const THREADS: usize = 8;
const ROUNDS: usize = 25;

#[test]
fn concurrent_retrievals_count_every_access() {
    let memory = AgentMemory::open_in_memory(2).unwrap();
    let agent = memory.register_agent("busy", None).unwrap().id;
    let ids: Vec<_> = (0..4)
        .map(|i| {
            memory
                .insert(AgentMemoryRecord::new(agent, format!("m{i}"), vec![1.0, i as f32 * 0.1]))
                .unwrap()
        })
        .collect();

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    memory.retrieve(&agent, &[1.0, 0.0], &MemoryQuery::default()).unwrap();
                }
            });
        }
    });

    for id in ids {
        assert_eq!(memory.get(&agent, &id).unwrap().access_count, (THREADS * ROUNDS) as u64);
    }
}

#[test]
fn concurrent_retrievals_on_a_shared_file() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let location = StorageLocation::File(dir.path().join("busy.db"));
    let memory = AgentMemory::open(&location, 2, IndexParams::default()).unwrap();
    let agent = memory.register_agent("busy", None).unwrap().id;
    let id = memory.insert(AgentMemoryRecord::new(agent, "m", vec![1.0, 0.0])).unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    memory.retrieve(&agent, &[1.0, 0.0], &MemoryQuery::default()).unwrap();
                }
            });
        }
    });

    assert_eq!(memory.get(&agent, &id).unwrap().access_count, (THREADS * ROUNDS) as u64);
}

#[test]
fn agents_are_isolated_under_parallel_load() {
    let memory = AgentMemory::open_in_memory(2).unwrap();
    let agents: Vec<_> = (0..THREADS)
        .map(|i| memory.register_agent(&format!("agent-{i}"), None).unwrap().id)
        .collect();

    thread::scope(|s| {
        for (i, agent) in agents.iter().enumerate() {
            let memory = &memory;
            s.spawn(move || {
                for r in 0..=i {
                    memory
                        .insert(AgentMemoryRecord::new(*agent, format!("{i}-{r}"), vec![1.0, 0.0]))
                        .unwrap();
                }
                memory.retrieve(agent, &[1.0, 0.0], &MemoryQuery::default()).unwrap();
            });
        }
    });

    for (i, agent) in agents.iter().enumerate() {
        let owned = memory.memories(agent).unwrap();
        assert_eq!(owned.len(), i + 1);
        assert!(owned.iter().all(|m| m.agent_id == *agent && m.access_count == 1));
    }
}

#[test]
fn readers_see_only_fully_inserted_documents() {
    let docs = DocumentMemory::open_in_memory(2).unwrap();
    let query = DocumentQuery {
        similarity_threshold: 0.0,
        max_results: 1000,
        ..DocumentQuery::default()
    };

    thread::scope(|s| {
        for w in 0..4 {
            let docs = &docs;
            s.spawn(move || {
                for i in 0..ROUNDS {
                    docs.insert(EmbeddingRecord::new(format!("w{w}-{i}"), vec![1.0, 0.05 * i as f32]))
                        .unwrap();
                }
            });
        }
        for _ in 0..4 {
            s.spawn(|| {
                let mut seen = 0;
                for _ in 0..ROUNDS {
                    // Every hit resolves to a stored record; the count only grows.
                    let hits = docs.find_similar(&[1.0, 0.0], &query).unwrap();
                    assert!(hits.len() >= seen);
                    seen = hits.len();
                }
            });
        }
    });

    assert_eq!(docs.len().unwrap(), 4 * ROUNDS);
}

#[test]
fn deleting_an_agent_during_inserts_leaves_no_rows() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let location = StorageLocation::File(dir.path().join("cascade.db"));
    let memory = AgentMemory::open(&location, 2, IndexParams::default()).unwrap();
    let agent = memory.register_agent("doomed", None).unwrap().id;
    let start = Barrier::new(THREADS + 1);

    thread::scope(|s| {
        for t in 0..THREADS {
            let (memory, start) = (&memory, &start);
            s.spawn(move || {
                start.wait();
                for i in 0..ROUNDS {
                    let record = AgentMemoryRecord::new(agent, format!("t{t}-{i}"), vec![1.0, 0.0]);
                    match memory.insert(record) {
                        Ok(_) | Err(MemoryError::NotFound(_)) => {}
                        Err(e) => panic!("unexpected insert error: {e}"),
                    }
                }
            });
        }
        s.spawn(|| {
            start.wait();
            memory.delete_agent(&agent).unwrap();
        });
    });

    let leftover = RecordStore::<AgentMemoryRecord>::open(&location, 2, Some(agent.to_string())).unwrap();
    assert_eq!(leftover.count().unwrap(), 0);
    assert!(memory.agent(&agent).is_err());
}

#[test]
fn two_document_handles_on_one_file_stay_in_step() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let location = StorageLocation::File(dir.path().join("docs.db"));
    let writer = DocumentMemory::open(&location, 2, IndexParams::default()).unwrap();
    let reader = DocumentMemory::open(&location, 2, IndexParams::default()).unwrap();
    let query = DocumentQuery {
        similarity_threshold: 0.0,
        max_results: THREADS * ROUNDS,
        ..DocumentQuery::default()
    };

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..THREADS * ROUNDS {
                let id = writer
                    .insert(EmbeddingRecord::new(format!("d{i}"), vec![1.0, 0.0]))
                    .unwrap();
                if i % 3 == 0 {
                    writer.delete(&id).unwrap();
                }
            }
        });
        s.spawn(|| {
            for _ in 0..ROUNDS {
                reader.find_similar(&[1.0, 0.0], &query).unwrap();
            }
        });
    });

    let hits = reader.find_similar(&[1.0, 0.0], &query).unwrap();
    assert_eq!(hits.len(), writer.len().unwrap());
    assert_eq!(reader.len().unwrap(), THREADS * ROUNDS - (THREADS * ROUNDS).div_ceil(3));
}
