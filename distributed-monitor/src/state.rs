/// The local automaton driving a single peer's view of the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    WaitingForCs,
    InCs,
    InCsWaiting,
}
