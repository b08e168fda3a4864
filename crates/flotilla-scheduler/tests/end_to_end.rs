//! Queue-to-placement flows across every crate, against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use flotilla_core::{Context, Guest, Resources};
use flotilla_jobqueue::{
    CREATE_TUBE, Client, JobStatus, MemoryQueue, QueueConfig, QueueError, SELECT_HYPERVISOR,
};
use flotilla_scheduler::{DELETE_ACTION, Scheduler, SchedulerConfig};
use flotilla_state::StateStore;

fn setup() -> (Context, Client, Arc<MemoryQueue>) {
    let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
    let queue = Arc::new(MemoryQueue::new());
    let config = QueueConfig {
        ttr: Duration::from_secs(30),
        release_delay: Duration::ZERO,
        reserve_timeout: Some(Duration::from_secs(5)),
        job_ttl: Duration::from_secs(600),
    };
    let client = Client::new(ctx.clone(), queue.clone(), config);
    (ctx, client, queue)
}

/// One live hypervisor on one /29, plus a guest ready to place.
fn small_fleet(ctx: &Context) -> Guest {
    let mut flavor = ctx.new_flavor();
    flavor.resources = Resources::new(512, 5, 1);
    flavor.save().unwrap();

    let mut network = ctx.new_network();
    network.save().unwrap();
    let mut subnet = ctx.new_subnet("192.168.10.0/29".parse().unwrap());
    network.add_subnet(&mut subnet).unwrap();

    let mut hv = ctx.new_hypervisor();
    hv.id = "hv-a".into();
    hv.total_resources = Resources::new(2048, 50, 4);
    hv.available_resources = hv.total_resources;
    hv.save().unwrap();
    hv.add_subnet(&subnet, "br-fleet").unwrap();
    hv.heartbeat(Duration::from_secs(60)).unwrap();

    let mut guest = ctx.new_guest();
    guest.id = "g1".into();
    guest.flavor_id = flavor.id;
    guest.network_id = network.id;
    guest.save().unwrap();
    guest
}

#[tokio::test]
async fn create_task_round_trip_then_queue_blocks() {
    let (ctx, client, _) = setup();
    let mut guest = small_fleet(&ctx);
    let job = client.add_job("g1", SELECT_HYPERVISOR).await.unwrap();

    let task = client.next_create_task().await.unwrap();
    assert_eq!(task.job.as_ref().unwrap().id, job.id);
    assert_eq!(task.guest.as_ref().unwrap().id, "g1");

    let mut hv = ctx.hypervisor("hv-a").unwrap();
    hv.add_guest(&mut guest).unwrap();
    task.delete().await.unwrap();

    let next = client
        .next_create_task_until(Instant::now() + Duration::from_millis(200))
        .await;
    assert!(matches!(next, Err(QueueError::Timeout(_))));

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.next_create_task().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.add_job("g1", SELECT_HYPERVISOR).await.unwrap();
    let task = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(task.job_id, second.id);
    assert!(task.guest.as_ref().unwrap().is_placed());
}

#[tokio::test]
async fn running_scheduler_places_then_deletes_guest() {
    let (ctx, client, queue) = setup();
    small_fleet(&ctx);
    let scheduler = Arc::new(Scheduler::new(client.clone(), SchedulerConfig::default()));

    let (tx, rx) = watch::channel(false);
    let create = tokio::spawn(scheduler.clone().run_create_loop(rx.clone()));
    let work = tokio::spawn(scheduler.clone().run_work_loop(rx));

    let create_job = client.add_job("g1", SELECT_HYPERVISOR).await.unwrap();
    wait_for_status(&client, &create_job.id, JobStatus::Done).await;

    let placed = ctx.guest("g1").unwrap();
    let placement = placed.placement().unwrap();
    assert_eq!(placement.hypervisor_id, "hv-a");
    assert_eq!(placement.bridge, "br-fleet");
    assert_eq!(
        ctx.hypervisor("hv-a").unwrap().available_resources,
        Resources::new(1536, 45, 3)
    );

    let delete_job = client.add_job("g1", DELETE_ACTION).await.unwrap();
    wait_for_status(&client, &delete_job.id, JobStatus::Done).await;

    assert!(ctx.guest("g1").unwrap_err().is_not_found());
    let hv = ctx.hypervisor("hv-a").unwrap();
    assert!(hv.guests().is_empty());
    assert_eq!(hv.available_resources, hv.total_resources);
    assert_eq!(queue.stats(CREATE_TUBE).await.ready, 0);

    tx.send(true).unwrap();
    for handle in [create, work] {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn competing_schedulers_place_each_guest_once() {
    let (ctx, client, _) = setup();
    let first = small_fleet(&ctx);

    let mut guests = vec![first.id.clone()];
    for n in 2..=4 {
        let mut g = ctx.new_guest();
        g.id = format!("g{n}");
        g.flavor_id = first.flavor_id.clone();
        g.network_id = first.network_id.clone();
        g.save().unwrap();
        guests.push(g.id);
    }

    let (tx, rx) = watch::channel(false);
    let mut loops = Vec::new();
    for _ in 0..3 {
        let scheduler = Arc::new(Scheduler::new(client.clone(), SchedulerConfig::default()));
        loops.push(tokio::spawn(scheduler.run_create_loop(rx.clone())));
    }

    let mut jobs = Vec::new();
    for id in &guests {
        jobs.push(client.add_job(id, SELECT_HYPERVISOR).await.unwrap());
    }
    for job in &jobs {
        wait_for_status(&client, &job.id, JobStatus::Done).await;
    }

    let hv = ctx.hypervisor("hv-a").unwrap();
    assert_eq!(hv.guests().len(), 4);
    let mut ips: Vec<_> = guests
        .iter()
        .map(|id| ctx.guest(id).unwrap().placement().unwrap().ip)
        .collect();
    ips.sort();
    ips.dedup();
    assert_eq!(ips.len(), 4);

    tx.send(true).unwrap();
    for handle in loops {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

async fn wait_for_status(client: &Client, job_id: &str, status: JobStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client.job(job_id).unwrap().status == status {
            return;
        }
        assert!(Instant::now() < deadline, "job {job_id} never reached {status}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
