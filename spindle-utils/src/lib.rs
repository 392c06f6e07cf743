use std::mem;
use std::process::abort;

/// Call [`abort`] when `f` panic
///
/// [`abort`]: https://doc.rust-lang.org/std/process/fn.abort.html
pub fn abort_on_panic<R>(f: impl FnOnce() -> R) -> R {
    struct Bomb;

    impl Drop for Bomb {
        fn drop(&mut self) {
            abort();
        }
    }

    let bomb = Bomb;

    let r = f();

    mem::forget(bomb);

    r
}

/// Defer the execution until the scope is done
#[macro_export]
macro_rules! defer {
  ($($body:tt)*) => {
      let _guard = {
          struct Guard<F: FnOnce()>(Option<F>);

          impl<F: FnOnce()> Drop for Guard<F> {
            fn drop(&mut self) {
                  self.0.take().map(|f| f());
              }
          }

          Guard(Some(|| {
              let _: () = { $($body)* };
          }))
      };
  };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_runs_at_scope_exit() {
        let mut order = Vec::new();
        {
            let order_ptr: *mut Vec<&str> = &mut order;
            defer! {
                unsafe { (*order_ptr).push("deferred") };
            }
            unsafe { (*order_ptr).push("body") };
        }
        assert_eq!(order, ["body", "deferred"]);
    }

    #[test]
    fn abort_on_panic_passes_value_through() {
        assert_eq!(abort_on_panic(|| 7), 7);
    }
}
