use crate::metrics::Metrics;
use fleet_planner::compiler::{Instruction, RobotProgram, SPIN_DEGREES};
use fleet_planner::interface::{InterfaceError, PhysicalInterface, RetryPolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Head instruction waiting to be sent.
    Pending,
    /// Head instruction sent, no answer yet.
    Dispatching,
    Drained,
    /// The robot refused the head instruction; nothing more is sent.
    Faulted,
}

/// One robot's instructions. The head is only removed once the robot
/// acknowledged it.
#[derive(Debug)]
pub struct RobotQueue {
    robot: String,
    instructions: VecDeque<Instruction>,
    state: QueueState,
    hold_until: Option<Instant>,
}

impl RobotQueue {
    pub fn new(program: RobotProgram) -> Self {
        let state = if program.instructions.is_empty() {
            QueueState::Drained
        } else {
            QueueState::Pending
        };
        Self {
            robot: program.robot,
            instructions: program.instructions.into(),
            state,
            hold_until: None,
        }
    }

    pub fn robot(&self) -> &str {
        &self.robot
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn head(&self) -> Option<&Instruction> {
        self.instructions.front()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, QueueState::Drained | QueueState::Faulted)
    }

    /// Marks the head as in flight and returns it, unless the queue is busy,
    /// settled or held by a previous `WAIT`.
    pub fn begin(&mut self, now: Instant) -> Option<Instruction> {
        if self.state != QueueState::Pending || self.hold_until.is_some_and(|t| now < t) {
            return None;
        }
        self.hold_until = None;
        let head = self.instructions.front().cloned()?;
        self.state = QueueState::Dispatching;
        Some(head)
    }

    /// Pops the acknowledged head. A `WAIT` holds the queue for its duration.
    pub fn acknowledge(&mut self, now: Instant) {
        if self.state != QueueState::Dispatching {
            return;
        }
        if let Some(Instruction::Wait(ms)) = self.instructions.pop_front() {
            self.hold_until = Some(now + Duration::from_millis(ms));
        }
        self.state = if self.instructions.is_empty() {
            QueueState::Drained
        } else {
            QueueState::Pending
        };
    }

    /// Keeps the head. Transient failures leave it pending for the next
    /// tick; a rejection faults the queue.
    pub fn fail(&mut self, error: &InterfaceError) {
        if self.state != QueueState::Dispatching {
            return;
        }
        self.state = if error.is_transient() {
            QueueState::Pending
        } else {
            QueueState::Faulted
        };
    }
}

/// Sends one instruction. `WAIT` never reaches the robot.
pub async fn execute(robot: &dyn PhysicalInterface, instruction: &Instruction) -> Result<(), InterfaceError> {
    match instruction {
        Instruction::Forward { distance_cm, .. } => robot.move_by(*distance_cm).await,
        Instruction::TurnRight(deg) => robot.turn(f64::from(*deg)).await,
        Instruction::TurnLeft(deg) => robot.turn(-f64::from(*deg)).await,
        Instruction::Pickup | Instruction::Dropoff => robot.turn(SPIN_DEGREES).await,
        Instruction::Wait(_) => Ok(()),
    }
}

/// Answer for the head instruction of one queue.
#[derive(Debug)]
struct Completion {
    queue: usize,
    result: Result<(), InterfaceError>,
}

/// Per-robot queues plus the interfaces to reach them.
///
/// Every send runs in its own task, so a slow or silent robot only holds up
/// its own queue. Answers are collected on the next [`tick`](Self::tick).
pub struct Dispatcher {
    queues: Vec<RobotQueue>,
    robots: HashMap<String, Arc<dyn PhysicalInterface>>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
    in_flight: HashMap<usize, JoinHandle<()>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl Dispatcher {
    pub fn new(robots: HashMap<String, Arc<dyn PhysicalInterface>>, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            queues: Vec::new(),
            robots,
            policy,
            metrics,
            in_flight: HashMap::new(),
            completions_tx,
            completions,
        }
    }

    /// Loads compiled programs. Programs for unknown robots are dropped.
    pub fn load(&mut self, programs: Vec<RobotProgram>) {
        for program in programs {
            if !self.robots.contains_key(&program.robot) {
                tracing::warn!(robot = %program.robot, "No interface for robot; program not dispatched");
                continue;
            }
            self.queues.push(RobotQueue::new(program));
        }
    }

    pub fn queues(&self) -> &[RobotQueue] {
        &self.queues
    }

    pub fn all_settled(&self) -> bool {
        self.queues.iter().all(RobotQueue::is_settled)
    }

    /// Applies the answers that arrived since the last tick, then starts a
    /// send for every queue whose head is ready. Never waits on a robot.
    pub fn tick(&mut self) {
        while let Ok(done) = self.completions.try_recv() {
            self.complete(done);
        }

        let now = Instant::now();
        for (i, queue) in self.queues.iter_mut().enumerate() {
            let Some(instruction) = queue.begin(now) else {
                continue;
            };
            if matches!(instruction, Instruction::Wait(_)) {
                queue.acknowledge(now);
                self.metrics
                    .instructions_dispatched_total
                    .with_label_values(&[queue.robot()])
                    .inc();
                continue;
            }
            let Some(robot) = self.robots.get(queue.robot()).cloned() else {
                continue;
            };

            tracing::debug!(robot = queue.robot(), instruction = %instruction, "Dispatching");
            let policy = self.policy;
            let metrics = self.metrics.clone();
            let tx = self.completions_tx.clone();
            let handle = tokio::spawn(async move {
                let name = robot.name().to_string();
                let result = policy
                    .run(
                        &name,
                        || execute(robot.as_ref(), &instruction),
                        |attempt, e| {
                            tracing::warn!(
                                robot = %name,
                                instruction = %instruction,
                                attempt,
                                error = %e,
                                "Dispatch failed; retrying"
                            );
                            metrics.dispatch_retries_total.inc();
                        },
                    )
                    .await;
                let _ = tx.send(Completion { queue: i, result });
            });
            self.in_flight.insert(i, handle);
        }
    }

    fn complete(&mut self, done: Completion) {
        self.in_flight.remove(&done.queue);
        let queue = &mut self.queues[done.queue];
        let instruction = queue.head().map(ToString::to_string).unwrap_or_default();
        match done.result {
            Ok(()) => {
                queue.acknowledge(Instant::now());
                self.metrics
                    .instructions_dispatched_total
                    .with_label_values(&[queue.robot()])
                    .inc();
                if queue.state() == QueueState::Drained {
                    tracing::info!(robot = queue.robot(), "Instruction queue drained");
                }
            }
            Err(e) => {
                queue.fail(&e);
                if queue.state() == QueueState::Faulted {
                    self.metrics.dispatch_rejections_total.inc();
                    tracing::error!(
                        robot = queue.robot(),
                        instruction = %instruction,
                        error = %e,
                        "Robot rejected instruction; halting its queue"
                    );
                } else {
                    tracing::warn!(
                        robot = queue.robot(),
                        instruction = %instruction,
                        error = %e,
                        "Robot unreachable; instruction kept for next tick"
                    );
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for handle in self.in_flight.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records commands; fails them according to a script.
    struct Scripted {
        failures: Mutex<VecDeque<InterfaceError>>,
        log: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(failures: Vec<InterfaceError>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.into()),
                log: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, entry: String) -> Result<(), InterfaceError> {
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            self.log.lock().unwrap().push(entry);
            Ok(())
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PhysicalInterface for Scripted {
        fn name(&self) -> &str {
            "robot1"
        }
        async fn connect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        async fn move_by(&self, distance: f64) -> Result<(), InterfaceError> {
            self.record(format!("move {distance}"))
        }
        async fn turn(&self, angle_degrees: f64) -> Result<(), InterfaceError> {
            self.record(format!("turn {angle_degrees}"))
        }
        async fn disconnect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        fn set_calibration(&self, _factor: f64) {}
        fn calibration(&self) -> f64 {
            1.0
        }
        async fn location(&self) -> Result<(f64, f64), InterfaceError> {
            Ok((0.0, 0.0))
        }
    }

    fn unreachable() -> InterfaceError {
        InterfaceError::RobotUnreachable {
            robot: "robot1".into(),
            reason: "timeout".into(),
        }
    }

    fn rejected() -> InterfaceError {
        InterfaceError::CommandRejected {
            robot: "robot1".into(),
            reason: "busy".into(),
        }
    }

    impl Dispatcher {
        /// Waits for every send in flight and applies the answers.
        async fn flush(&mut self) {
            while !self.in_flight.is_empty() {
                let done = self.completions.recv().await.unwrap();
                self.complete(done);
            }
        }

        async fn step(&mut self) {
            self.tick();
            self.flush().await;
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(100),
        }
    }

    fn dispatcher(robot: Arc<Scripted>, attempts: u32, instructions: Vec<Instruction>) -> Dispatcher {
        let mut robots: HashMap<String, Arc<dyn PhysicalInterface>> = HashMap::new();
        robots.insert("robot1".into(), robot);
        let mut d = Dispatcher::new(robots, policy(attempts), Arc::new(Metrics::new()));
        d.load(vec![RobotProgram {
            robot: "robot1".into(),
            instructions,
        }]);
        d
    }

    fn forward(cm: f64) -> Instruction {
        Instruction::Forward {
            cells: 1,
            distance_cm: cm,
        }
    }

    #[tokio::test]
    async fn instructions_map_onto_interface_calls() {
        let robot = Scripted::new(vec![]);
        let mut d = dispatcher(
            robot.clone(),
            1,
            vec![forward(6.0), Instruction::TurnLeft(90), Instruction::TurnRight(45), Instruction::Pickup],
        );
        for _ in 0..4 {
            d.step().await;
        }
        assert_eq!(robot.log(), vec!["move 6", "turn -90", "turn 45", "turn 360"]);
        assert!(d.all_settled());
        assert_eq!(d.queues()[0].state(), QueueState::Drained);
    }

    #[tokio::test]
    async fn transient_failure_keeps_the_head_until_acknowledged() {
        let robot = Scripted::new(vec![unreachable(), unreachable()]);
        let mut d = dispatcher(robot.clone(), 1, vec![forward(3.0), forward(4.0)]);

        d.step().await;
        assert_eq!(d.queues()[0].len(), 2);
        assert_eq!(d.queues()[0].state(), QueueState::Pending);
        d.step().await;
        assert_eq!(d.queues()[0].len(), 2);

        d.step().await;
        d.step().await;
        assert_eq!(robot.log(), vec!["move 3", "move 4"]);
        assert_eq!(d.queues()[0].state(), QueueState::Drained);
    }

    #[tokio::test]
    async fn retries_within_one_tick_with_backoff() {
        let robot = Scripted::new(vec![unreachable(), unreachable()]);
        let mut d = dispatcher(robot.clone(), 3, vec![forward(3.0)]);
        d.step().await;
        assert_eq!(robot.log(), vec!["move 3"]);
        assert_eq!(d.metrics.dispatch_retries_total.get(), 2);
        assert!(d.all_settled());
    }

    #[tokio::test]
    async fn rejection_halts_the_queue() {
        let robot = Scripted::new(vec![rejected()]);
        let mut d = dispatcher(robot.clone(), 3, vec![forward(3.0), forward(4.0)]);
        for _ in 0..3 {
            d.step().await;
        }
        let queue = &d.queues()[0];
        assert_eq!(queue.state(), QueueState::Faulted);
        assert_eq!(queue.head(), Some(&forward(3.0)));
        assert!(robot.log().is_empty());
        assert_eq!(d.metrics.dispatch_rejections_total.get(), 1);
        assert!(d.all_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_holds_the_queue() {
        let robot = Scripted::new(vec![]);
        let mut d = dispatcher(robot.clone(), 1, vec![Instruction::Wait(500), forward(2.0)]);

        d.step().await;
        d.step().await;
        assert!(robot.log().is_empty());

        tokio::time::advance(Duration::from_millis(501)).await;
        d.step().await;
        assert_eq!(robot.log(), vec!["move 2"]);
    }

    /// Accepts the connection, then never answers a move.
    struct Silent;

    #[async_trait]
    impl PhysicalInterface for Silent {
        fn name(&self) -> &str {
            "robot2"
        }
        async fn connect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        async fn move_by(&self, _distance: f64) -> Result<(), InterfaceError> {
            std::future::pending().await
        }
        async fn turn(&self, _angle_degrees: f64) -> Result<(), InterfaceError> {
            std::future::pending().await
        }
        async fn disconnect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }
        fn set_calibration(&self, _factor: f64) {}
        fn calibration(&self) -> f64 {
            1.0
        }
        async fn location(&self) -> Result<(f64, f64), InterfaceError> {
            Ok((0.0, 0.0))
        }
    }

    #[tokio::test]
    async fn silent_robot_does_not_hold_up_the_others() {
        let healthy = Scripted::new(vec![]);
        let mut robots: HashMap<String, Arc<dyn PhysicalInterface>> = HashMap::new();
        robots.insert("robot1".into(), healthy.clone());
        robots.insert("robot2".into(), Arc::new(Silent));
        let mut d = Dispatcher::new(robots, policy(1), Arc::new(Metrics::new()));
        d.load(vec![
            RobotProgram {
                robot: "robot1".into(),
                instructions: vec![forward(1.0), forward(2.0), forward(3.0)],
            },
            RobotProgram {
                robot: "robot2".into(),
                instructions: vec![forward(5.0)],
            },
        ]);

        tokio::time::timeout(Duration::from_millis(80), async {
            while d.queues()[0].state() != QueueState::Drained {
                d.tick();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("healthy robot stalled behind the silent one");
        assert_eq!(healthy.log(), vec!["move 1", "move 2", "move 3"]);
        assert_eq!(d.queues()[1].state(), QueueState::Dispatching);

        // The silent send times out and the instruction stays queued.
        tokio::time::sleep(Duration::from_millis(150)).await;
        d.tick();
        assert_eq!(d.queues()[1].len(), 1);
        assert!(!d.all_settled());
    }

    #[test]
    fn queue_states_follow_acknowledgements() {
        let now = Instant::now();
        let mut q = RobotQueue::new(RobotProgram {
            robot: "robot1".into(),
            instructions: vec![Instruction::Dropoff],
        });
        assert_eq!(q.state(), QueueState::Pending);
        assert_eq!(q.begin(now), Some(Instruction::Dropoff));
        assert_eq!(q.state(), QueueState::Dispatching);
        // Busy queues hand out nothing.
        assert_eq!(q.begin(now), None);
        q.acknowledge(now);
        assert_eq!(q.state(), QueueState::Drained);

        let empty = RobotQueue::new(RobotProgram {
            robot: "robot2".into(),
            instructions: vec![],
        });
        assert!(empty.is_settled());
    }
}
