#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum State {
    #[default]
    Greeting,
    AfterEhlo,
    AfterAuth,
    MailFrom,
    RcptTo,
    Data,
    Done,
}

impl State {
    /// States in which a new mail transaction may begin.
    pub fn accepts_mail(self, auth_required: bool) -> bool {
        match self {
            State::AfterAuth | State::Done => true,
            State::AfterEhlo => !auth_required,
            _ => false,
        }
    }
}
